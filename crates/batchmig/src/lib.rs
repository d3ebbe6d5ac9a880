//! Batchmig - Batched background migrations.
//!
//! Runs long data migrations over large numeric ranges in small,
//! checkpointed batches spread across time and across a fleet of
//! processes. Progress survives restarts; a fleet-wide lock keeps two
//! processes from working the same migration at once.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use batchmig::{
//!     InProcessLockService, MigrationRegistry, Migrator, MigratorConfig, SqliteMigrationStore,
//! };
//! # async fn run(handler: Arc<dyn batchmig::MigrationHandler>) -> Result<(), batchmig::Error> {
//! let registry = MigrationRegistry::new().with("20230406184103_backfill_emails.rs", handler)?;
//! let migrator = Migrator::new(
//!     MigratorConfig::new("app"),
//!     Arc::new(SqliteMigrationStore::open("migrations.db")?),
//!     Arc::new(InProcessLockService::new()),
//!     registry,
//! );
//!
//! migrator.enqueue("20230406184103_backfill_emails").await?;
//! migrator.start();
//! // ...
//! migrator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod definition;
pub mod error;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use config::MigratorConfig;
pub use definition::{
    discover_definitions, parse_timestamp, DefinitionFile, MigrationHandler, MigrationParameters,
    MigrationRegistry, RegisteredMigration,
};
pub use error::{Error, HandlerError};
pub use lock::{
    lock_key, InProcessLockService, LockLease, LockService, SharedLockService,
    SqliteLeaseLockService,
};
pub use migrator::Migrator;
pub use record::{MigrationRecord, MigrationStatus, NewMigration};
pub use runner::{BatchRange, BatchRunner, RunBudget, RunOutcome, RunStatus};
pub use scheduler::{RoundOutcome, Scheduler, SchedulerEvent, SchedulerState};
pub use store::{MigrationStore, SharedMigrationStore, SqliteMigrationStore};

// Postgres backends
#[cfg(feature = "postgres")]
pub use lock::PgAdvisoryLockService;
#[cfg(feature = "postgres")]
pub use store::PostgresMigrationStore;
