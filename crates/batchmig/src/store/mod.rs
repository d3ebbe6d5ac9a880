//! Durable storage for migration records.
//!
//! The store is the only state shared between scheduler processes. Cursor
//! and status writes happen under the migration's distributed lock; the
//! pending → running handoff happens inside the store's own transactional
//! claim.

mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

pub use sqlite::SqliteMigrationStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresMigrationStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::record::{MigrationRecord, MigrationStatus, NewMigration};

/// Table holding one row per migration per project.
pub const TABLE_NAME: &str = "batched_migrations";

/// Record store operations used by the runner, scheduler and migrator.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Fails with [`Error::AlreadyExists`] if the project already has a
    /// record for the timestamp.
    async fn insert(&self, migration: NewMigration) -> Result<MigrationRecord, Error>;

    /// Fetch a record by store ID.
    async fn select_by_id(&self, id: i64) -> Result<MigrationRecord, Error>;

    /// Fetch a record by project and timestamp.
    ///
    /// Fails with [`Error::NotFound`] if there is none.
    async fn select_for_timestamp(
        &self,
        project: &str,
        timestamp: &str,
    ) -> Result<MigrationRecord, Error>;

    /// All records of a project in insertion order.
    async fn select_all_for_project(&self, project: &str) -> Result<Vec<MigrationRecord>, Error>;

    /// Move a record to a new status.
    ///
    /// `succeeded` records only accept `succeeded`.
    async fn update_status(&self, id: i64, status: MigrationStatus) -> Result<(), Error>;

    /// Persist a batch checkpoint.
    ///
    /// Fails with [`Error::CursorOutOfRange`] if the cursor would regress or
    /// pass `max_value`.
    async fn update_cursor(&self, id: i64, cursor: i64) -> Result<(), Error>;

    /// Atomically pick the oldest runnable migration of a project.
    ///
    /// Within one transaction: locks the candidate rows, selects the lowest
    /// ID whose status is `pending` or `running`, moves a `pending` one to
    /// `running`, and returns it. Concurrent callers serialize on the
    /// candidate rows, so a pending record is claimed exactly once.
    async fn select_or_start_runnable(&self, project: &str) -> Result<Option<MigrationRecord>, Error>;
}

/// Thread-safe store handle.
pub type SharedMigrationStore = Arc<dyn MigrationStore>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_migration(project: &str, timestamp: &str, min: i64, max: i64) -> NewMigration {
        NewMigration {
            project: project.to_string(),
            filename: format!("{}_backfill.rs", timestamp),
            timestamp: timestamp.to_string(),
            batch_size: 1000,
            min_value: min,
            max_value: max,
            status: MigrationStatus::Pending,
        }
    }

    /// Contract checks every store implementation must pass.
    pub async fn exercise_store(store: &dyn MigrationStore) {
        // Insert and read back
        let first = store
            .insert(new_migration("app", "20230406184103", 1, 2500))
            .await
            .unwrap();
        assert_eq!(first.status, MigrationStatus::Pending);
        assert_eq!(first.cursor, 0);
        assert_eq!(
            store.select_for_timestamp("app", "20230406184103").await.unwrap(),
            first
        );
        assert_eq!(store.select_by_id(first.id).await.unwrap(), first);

        // Duplicate insert
        let err = store
            .insert(new_migration("app", "20230406184103", 1, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        // Same timestamp in another project is independent
        let other_project = store
            .insert(new_migration("billing", "20230406184103", 1, 10))
            .await
            .unwrap();
        assert_ne!(other_project.id, first.id);

        let second = store
            .insert(new_migration("app", "20230501000000", 1, 10))
            .await
            .unwrap();

        // Missing lookups
        assert!(matches!(
            store.select_for_timestamp("app", "20990101000000").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.select_by_id(i64::MAX).await,
            Err(Error::UnknownRecord { .. })
        ));

        // Listing is per project, in insertion order
        let listed: Vec<_> = store
            .select_all_for_project("app")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(listed, ["20230406184103", "20230501000000"]);

        // Claim picks the oldest pending and starts it
        let claimed = store.select_or_start_runnable("app").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, MigrationStatus::Running);

        // A running migration keeps priority over newer pending ones
        let again = store.select_or_start_runnable("app").await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(
            store.select_by_id(second.id).await.unwrap().status,
            MigrationStatus::Pending
        );

        // Cursor checkpoints
        store.update_cursor(first.id, 1000).await.unwrap();
        assert_eq!(store.select_by_id(first.id).await.unwrap().cursor, 1000);
        assert!(matches!(
            store.update_cursor(first.id, 999).await,
            Err(Error::CursorOutOfRange { .. })
        ));
        assert!(matches!(
            store.update_cursor(first.id, 2501).await,
            Err(Error::CursorOutOfRange { .. })
        ));
        assert!(matches!(
            store.update_cursor(i64::MAX, 1).await,
            Err(Error::UnknownRecord { .. })
        ));

        // Paused migrations are skipped by the claim
        store
            .update_status(first.id, MigrationStatus::Paused)
            .await
            .unwrap();
        let next = store.select_or_start_runnable("app").await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
        assert_eq!(next.status, MigrationStatus::Running);

        // Succeeded is final
        store
            .update_status(second.id, MigrationStatus::Succeeded)
            .await
            .unwrap();
        store
            .update_status(second.id, MigrationStatus::Succeeded)
            .await
            .unwrap();
        assert!(matches!(
            store.update_status(second.id, MigrationStatus::Running).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.update_status(i64::MAX, MigrationStatus::Running).await,
            Err(Error::UnknownRecord { .. })
        ));

        // Nothing runnable left for the project
        assert!(store.select_or_start_runnable("app").await.unwrap().is_none());
        assert!(store.select_or_start_runnable("nobody").await.unwrap().is_none());
    }
}
