//! PostgreSQL-backed migration record store.
//!
//! Enable with `--features postgres`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use super::MigrationStore;
use crate::error::Error;
use crate::record::{MigrationRecord, MigrationStatus, NewMigration};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batched_migrations (
    id BIGSERIAL PRIMARY KEY,
    project TEXT NOT NULL,
    filename TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    batch_size BIGINT NOT NULL,
    min_value BIGINT NOT NULL,
    max_value BIGINT NOT NULL,
    cursor_value BIGINT NOT NULL,
    status TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (project, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_batched_migrations_runnable
    ON batched_migrations(project, status, id);
"#;

const COLUMNS: &str = "id, project, filename, timestamp, batch_size, min_value, max_value, \
     cursor_value, status, updated_at";

/// Migration store on a PostgreSQL database.
#[derive(Clone)]
pub struct PostgresMigrationStore {
    pool: PgPool,
}

impl PostgresMigrationStore {
    /// Wrap a pool, creating the table if needed.
    pub async fn new(pool: PgPool) -> Result<Self, Error> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect to `database_url` and create the table if needed.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn read_record(row: &PgRow) -> Result<MigrationRecord, Error> {
    let status: String = row.try_get("status")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(MigrationRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        filename: row.try_get("filename")?,
        timestamp: row.try_get("timestamp")?,
        batch_size: row.try_get("batch_size")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        cursor: row.try_get("cursor_value")?,
        status: status.parse()?,
        updated_at,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn insert(&self, migration: NewMigration) -> Result<MigrationRecord, Error> {
        migration.validate()?;
        let sql = format!(
            "INSERT INTO batched_migrations (project, filename, timestamp, batch_size, \
             min_value, max_value, cursor_value, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(&migration.project)
            .bind(&migration.filename)
            .bind(&migration.timestamp)
            .bind(migration.batch_size)
            .bind(migration.min_value)
            .bind(migration.max_value)
            .bind(migration.initial_cursor())
            .bind(migration.status.as_str())
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => read_record(&row),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists {
                project: migration.project,
                timestamp: migration.timestamp,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn select_by_id(&self, id: i64) -> Result<MigrationRecord, Error> {
        let sql = format!("SELECT {} FROM batched_migrations WHERE id = $1", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::UnknownRecord { id })?;
        read_record(&row)
    }

    async fn select_for_timestamp(
        &self,
        project: &str,
        timestamp: &str,
    ) -> Result<MigrationRecord, Error> {
        let sql = format!(
            "SELECT {} FROM batched_migrations WHERE project = $1 AND timestamp = $2",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(project)
            .bind(timestamp)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound {
                project: project.to_string(),
                timestamp: timestamp.to_string(),
            })?;
        read_record(&row)
    }

    async fn select_all_for_project(&self, project: &str) -> Result<Vec<MigrationRecord>, Error> {
        let sql = format!(
            "SELECT {} FROM batched_migrations WHERE project = $1 ORDER BY id",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(project)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(read_record)
            .collect()
    }

    async fn update_status(&self, id: i64, status: MigrationStatus) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {} FROM batched_migrations WHERE id = $1 FOR UPDATE", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::UnknownRecord { id })?;
        let current = read_record(&row)?;

        if current.status == MigrationStatus::Succeeded && status != MigrationStatus::Succeeded {
            return Err(Error::InvalidTransition {
                action: "change status of",
                timestamp: current.timestamp,
                status: current.status,
            });
        }

        sqlx::query("UPDATE batched_migrations SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_cursor(&self, id: i64, cursor: i64) -> Result<(), Error> {
        let updated = sqlx::query(
            "UPDATE batched_migrations SET cursor_value = $2, updated_at = now() \
             WHERE id = $1 AND $2 >= cursor_value AND $2 <= max_value",
        )
        .bind(id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT id FROM batched_migrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(Error::CursorOutOfRange { id, cursor }),
            None => Err(Error::UnknownRecord { id }),
        }
    }

    async fn select_or_start_runnable(&self, project: &str) -> Result<Option<MigrationRecord>, Error> {
        let mut tx = self.pool.begin().await?;

        // Row locks make a racing claimer block until this commits, after
        // which it re-evaluates the row and sees `running`.
        let sql = format!(
            "SELECT {} FROM batched_migrations \
             WHERE project = $1 AND status IN ('pending', 'running') \
             ORDER BY id LIMIT 1 FOR UPDATE",
            COLUMNS
        );
        let candidate = sqlx::query(&sql)
            .bind(project)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| read_record(&row))
            .transpose()?;

        let claimed = match candidate {
            Some(record) if record.status == MigrationStatus::Pending => {
                let sql = format!(
                    "UPDATE batched_migrations SET status = 'running', updated_at = now() \
                     WHERE id = $1 RETURNING {}",
                    COLUMNS
                );
                let row = sqlx::query(&sql).bind(record.id).fetch_one(&mut *tx).await?;
                let record = read_record(&row)?;
                tracing::info!(
                    project = %record.project,
                    timestamp = %record.timestamp,
                    migration_id = record.id,
                    "claimed pending batched migration"
                );
                Some(record)
            }
            other => other,
        };

        tx.commit().await?;
        Ok(claimed)
    }
}
