//! SQLite-backed migration record store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use super::MigrationStore;
use crate::error::Error;
use crate::record::{MigrationRecord, MigrationStatus, NewMigration};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batched_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    filename TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    batch_size INTEGER NOT NULL,
    min_value INTEGER NOT NULL,
    max_value INTEGER NOT NULL,
    cursor_value INTEGER NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_batched_migrations_runnable
    ON batched_migrations(project, status, id);
"#;

const SELECT_COLUMNS: &str = "SELECT id, project, filename, timestamp, batch_size, min_value, \
     max_value, cursor_value, status, updated_at FROM batched_migrations";

/// Migration store on a SQLite database.
///
/// Several processes may open the same database file; the claim runs in a
/// `BEGIN IMMEDIATE` transaction so only one of them can move a pending
/// record to running.
#[derive(Clone)]
pub struct SqliteMigrationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMigrationStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create a private in-memory store.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating the table if needed.
    pub fn from_connection(conn: Connection) -> Result<Self, Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_record(row: &Row<'_>) -> Result<MigrationRecord, Error> {
    let status: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| Error::Corrupt(format!("bad updated_at {:?}: {}", updated_at, e)))?
        .with_timezone(&Utc);

    Ok(MigrationRecord {
        id: row.get(0)?,
        project: row.get(1)?,
        filename: row.get(2)?,
        timestamp: row.get(3)?,
        batch_size: row.get(4)?,
        min_value: row.get(5)?,
        max_value: row.get(6)?,
        cursor: row.get(7)?,
        status: status.parse()?,
        updated_at,
    })
}

fn query_one(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<MigrationRecord>, Error> {
    let sql = format!("{} {}", SELECT_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(read_record(row)?)),
        None => Ok(None),
    }
}

fn by_id(conn: &Connection, id: i64) -> Result<MigrationRecord, Error> {
    query_one(conn, "WHERE id = ?1", params![id])?.ok_or(Error::UnknownRecord { id })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl MigrationStore for SqliteMigrationStore {
    async fn insert(&self, migration: NewMigration) -> Result<MigrationRecord, Error> {
        migration.validate()?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO batched_migrations (project, filename, timestamp, batch_size, \
                 min_value, max_value, cursor_value, status, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    migration.project,
                    migration.filename,
                    migration.timestamp,
                    migration.batch_size,
                    migration.min_value,
                    migration.max_value,
                    migration.initial_cursor(),
                    migration.status.as_str(),
                    now_string(),
                ],
            );

            match inserted {
                Ok(_) => by_id(conn, conn.last_insert_rowid()),
                Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists {
                    project: migration.project,
                    timestamp: migration.timestamp,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn select_by_id(&self, id: i64) -> Result<MigrationRecord, Error> {
        self.with_conn(move |conn| by_id(conn, id)).await
    }

    async fn select_for_timestamp(
        &self,
        project: &str,
        timestamp: &str,
    ) -> Result<MigrationRecord, Error> {
        let project = project.to_string();
        let timestamp = timestamp.to_string();
        self.with_conn(move |conn| {
            let found = query_one(
                conn,
                "WHERE project = ?1 AND timestamp = ?2",
                params![project, timestamp],
            )?;
            found.ok_or(Error::NotFound { project, timestamp })
        })
        .await
    }

    async fn select_all_for_project(&self, project: &str) -> Result<Vec<MigrationRecord>, Error> {
        let project = project.to_string();
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE project = ?1 ORDER BY id", SELECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![project])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(read_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    async fn update_status(&self, id: i64, status: MigrationStatus) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = by_id(&tx, id)?;

            if current.status == MigrationStatus::Succeeded && status != MigrationStatus::Succeeded
            {
                return Err(Error::InvalidTransition {
                    action: "change status of",
                    timestamp: current.timestamp,
                    status: current.status,
                });
            }

            tx.execute(
                "UPDATE batched_migrations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_cursor(&self, id: i64, cursor: i64) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE batched_migrations SET cursor_value = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND ?2 >= cursor_value AND ?2 <= max_value",
                params![id, cursor, now_string()],
            )?;
            if updated == 1 {
                return Ok(());
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM batched_migrations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(_) => Err(Error::CursorOutOfRange { id, cursor }),
                None => Err(Error::UnknownRecord { id }),
            }
        })
        .await
    }

    async fn select_or_start_runnable(&self, project: &str) -> Result<Option<MigrationRecord>, Error> {
        let project = project.to_string();
        self.with_conn(move |conn| {
            // IMMEDIATE takes the database write lock up front, so a second
            // claimer waits here and then sees the committed status.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidate = query_one(
                &tx,
                "WHERE project = ?1 AND status IN ('pending', 'running') ORDER BY id LIMIT 1",
                params![project],
            )?;

            let claimed = match candidate {
                Some(mut record) if record.status == MigrationStatus::Pending => {
                    tx.execute(
                        "UPDATE batched_migrations SET status = 'running', updated_at = ?2 \
                         WHERE id = ?1 AND status = 'pending'",
                        params![record.id, now_string()],
                    )?;
                    record = by_id(&tx, record.id)?;
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

            tx.commit()?;
            Ok(claimed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{exercise_store, new_migration};

    #[tokio::test]
    async fn test_store_contract_in_memory() {
        let store = SqliteMigrationStore::open_in_memory().unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_store_contract_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteMigrationStore::open(dir.path().join("migrations.db")).unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrations.db");

        let id = {
            let store = SqliteMigrationStore::open(&path).unwrap();
            let record = store
                .insert(new_migration("app", "20230406184103", 1, 2500))
                .await
                .unwrap();
            store.update_cursor(record.id, 2000).await.unwrap();
            record.id
        };

        let store = SqliteMigrationStore::open(&path).unwrap();
        let record = store.select_by_id(id).await.unwrap();
        assert_eq!(record.cursor, 2000);
        assert_eq!(record.max_value, 2500);
    }

    #[tokio::test]
    async fn test_succeeded_insert_starts_at_end() {
        let store = SqliteMigrationStore::open_in_memory().unwrap();
        let mut new = new_migration("app", "20230406184103", 1, 0);
        new.status = MigrationStatus::Succeeded;

        let record = store.insert(new).await.unwrap();
        assert_eq!(record.status, MigrationStatus::Succeeded);
        assert!(record.is_exhausted());
        assert!(store.select_or_start_runnable("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_range_starting_at_i64_min() {
        let store = SqliteMigrationStore::open_in_memory().unwrap();
        let new = new_migration("app", "20230406184103", i64::MIN, i64::MIN + 5);

        let err = store.insert(new).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));
        assert!(store.select_all_for_project("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrations.db");

        let setup = SqliteMigrationStore::open(&path).unwrap();
        setup
            .insert(new_migration("app", "20230406184103", 1, 10))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = SqliteMigrationStore::open(&path).unwrap();
            handles.push(tokio::spawn(async move {
                store.select_or_start_runnable("app").await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            let claimed = handle.await.unwrap().unwrap();
            assert_eq!(claimed.status, MigrationStatus::Running);
            ids.push(claimed.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let record = setup.select_for_timestamp("app", "20230406184103").await.unwrap();
        assert_eq!(record.status, MigrationStatus::Running);
    }
}
