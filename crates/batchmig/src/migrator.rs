//! Operator control surface.
//!
//! [`Migrator`] bundles a record store, a lock service and the definitions
//! this process was deployed with. Deploy tooling uses it to enqueue new
//! migrations and to force completion before dependent changes ship; the
//! same instance owns the background [`Scheduler`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MigratorConfig;
use crate::definition::{parse_timestamp, MigrationRegistry, RegisteredMigration};
use crate::error::Error;
use crate::lock::{self, LockLease, SharedLockService};
use crate::record::{MigrationRecord, MigrationStatus, NewMigration};
use crate::runner::{BatchRunner, RunBudget};
use crate::scheduler::Scheduler;
use crate::store::SharedMigrationStore;

/// Batched migration control surface for one project.
pub struct Migrator {
    config: MigratorConfig,
    store: SharedMigrationStore,
    locks: SharedLockService,
    registry: Arc<MigrationRegistry>,
    runner: BatchRunner,
    scheduler: Scheduler,
}

impl Migrator {
    /// Create a migrator. The scheduler is not started.
    pub fn new(
        config: MigratorConfig,
        store: SharedMigrationStore,
        locks: SharedLockService,
        registry: MigrationRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let runner = BatchRunner::new(Arc::clone(&store)).with_batch_delay(config.batch_delay);
        let scheduler = Scheduler::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&registry),
        );

        Self {
            config,
            store,
            locks,
            registry,
            runner,
            scheduler,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Definitions known to this process.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// The background scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start the background scheduler. Returns false if already running.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Stop the background scheduler and wait for it to exit.
    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    /// Record a new migration.
    ///
    /// A definition reporting no upper bound is recorded as `succeeded`
    /// straight away and its batches never run.
    pub async fn enqueue(&self, identifier: &str) -> Result<MigrationRecord, Error> {
        let migration = self.resolve(identifier)?;
        let timestamp = migration.timestamp.clone();

        let params = migration
            .handler
            .parameters()
            .await
            .map_err(|source| Error::Parameters {
                timestamp: timestamp.clone(),
                source,
            })?;

        let min_value = params.min.unwrap_or(self.config.default_min_value);
        let (max_value, status) = match params.max {
            Some(max) => (max, MigrationStatus::Pending),
            // Empty range: nothing to run
            None => (min_value.saturating_sub(1), MigrationStatus::Succeeded),
        };

        let migration = NewMigration {
            project: self.config.project.clone(),
            filename: migration.filename.clone(),
            timestamp,
            batch_size: params.batch_size.unwrap_or(self.config.default_batch_size),
            min_value,
            max_value,
            status,
        };
        migration.validate()?;

        let record = self.store.insert(migration).await?;

        info!(
            project = %record.project,
            timestamp = %record.timestamp,
            min_value = record.min_value,
            max_value = record.max_value,
            batch_size = record.batch_size,
            status = %record.status,
            "Enqueued batched migration"
        );
        Ok(record)
    }

    /// Run a migration's remaining batches now, ignoring the round budget.
    ///
    /// Waits for the migration's lock if a scheduler holds it. On a batch
    /// failure the record is left `finalizing` and the error returned.
    pub async fn finalize(&self, identifier: &str) -> Result<MigrationRecord, Error> {
        let timestamp = parse_timestamp(identifier)?;
        let record = self
            .store
            .select_for_timestamp(&self.config.project, timestamp)
            .await?;
        if record.status == MigrationStatus::Succeeded {
            return Ok(record);
        }

        let migration = self.resolve(identifier)?;
        let lease = lock::lock_with_timeout(
            &self.locks,
            &record.lock_key(),
            self.config.finalize_lock_timeout,
            self.config.lock_retry_interval,
        )
        .await?;

        let result = self.finalize_locked(record.id, migration, &lease).await;
        if let Err(e) = lease.release().await {
            warn!(key = %record.lock_key(), error = %e, "Failed to release migration lock");
        }
        result
    }

    async fn finalize_locked(
        &self,
        id: i64,
        migration: &RegisteredMigration,
        lease: &LockLease,
    ) -> Result<MigrationRecord, Error> {
        let mut record = self.store.select_by_id(id).await?;
        if record.status == MigrationStatus::Succeeded {
            return Ok(record);
        }
        if record.status != MigrationStatus::Finalizing {
            self.store
                .update_status(id, MigrationStatus::Finalizing)
                .await?;
            record.status = MigrationStatus::Finalizing;
        }

        info!(
            timestamp = %record.timestamp,
            cursor = record.cursor,
            max_value = record.max_value,
            "Finalizing batched migration"
        );
        let cancel = lease.guard(&CancellationToken::new());
        let _unlink = cancel.clone().drop_guard();
        let result = self
            .runner
            .run(
                &record,
                migration.handler.as_ref(),
                RunBudget::unlimited(),
                &cancel,
            )
            .await;
        if lease.is_lost() {
            warn!(
                key = %lease.key(),
                timestamp = %record.timestamp,
                "Migration lock lost while finalizing"
            );
            return Err(Error::LockLost {
                key: lease.key().to_string(),
            });
        }
        let outcome = result?;

        let record = self.store.select_by_id(id).await?;
        if record.status != MigrationStatus::Succeeded {
            return Err(Error::InconsistentState {
                timestamp: record.timestamp,
                status: record.status,
            });
        }

        info!(
            timestamp = %record.timestamp,
            batches = outcome.batches,
            "Finalized batched migration"
        );
        Ok(record)
    }

    /// A migration's record.
    pub async fn status(&self, identifier: &str) -> Result<MigrationRecord, Error> {
        let timestamp = parse_timestamp(identifier)?;
        self.store
            .select_for_timestamp(&self.config.project, timestamp)
            .await
    }

    /// All records of the project in enqueue order.
    pub async fn list(&self) -> Result<Vec<MigrationRecord>, Error> {
        self.store.select_all_for_project(&self.config.project).await
    }

    /// Stop schedulers from picking up a migration.
    ///
    /// A round already running finishes its budget.
    pub async fn pause(&self, identifier: &str) -> Result<MigrationRecord, Error> {
        self.transition(identifier, "pause", MigrationStatus::Paused, |status| {
            status.is_runnable()
        })
        .await
    }

    /// Hand a paused migration back to the schedulers.
    pub async fn resume(&self, identifier: &str) -> Result<MigrationRecord, Error> {
        self.transition(identifier, "resume", MigrationStatus::Pending, |status| {
            status == MigrationStatus::Paused
        })
        .await
    }

    async fn transition(
        &self,
        identifier: &str,
        action: &'static str,
        to: MigrationStatus,
        allowed: impl Fn(MigrationStatus) -> bool,
    ) -> Result<MigrationRecord, Error> {
        let mut record = self.status(identifier).await?;
        if !allowed(record.status) {
            return Err(Error::InvalidTransition {
                action,
                timestamp: record.timestamp,
                status: record.status,
            });
        }

        self.store.update_status(record.id, to).await?;
        info!(
            timestamp = %record.timestamp,
            from = %record.status,
            to = %to,
            "Batched migration {}d",
            action
        );
        record.status = to;
        Ok(record)
    }

    fn resolve(&self, identifier: &str) -> Result<&RegisteredMigration, Error> {
        let timestamp = parse_timestamp(identifier)?;
        self.registry
            .resolve(timestamp)
            .ok_or_else(|| Error::NotFound {
                project: self.config.project.clone(),
                timestamp: timestamp.to_string(),
            })
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("project", &self.config.project)
            .field("definitions", &self.registry.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
