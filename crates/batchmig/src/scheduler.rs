//! Background scheduling loop.
//!
//! Each process runs at most one loop per project. A round claims the
//! oldest runnable migration, takes its lock, runs batches for up to the
//! round budget and releases the lock. Rounds that moved a migration forward
//! are followed immediately by another; idle rounds sleep for the poll
//! interval.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigratorConfig;
use crate::definition::{MigrationRegistry, RegisteredMigration};
use crate::error::Error;
use crate::lock::{self, LockLease, SharedLockService};
use crate::record::{MigrationRecord, MigrationStatus};
use crate::runner::{BatchRunner, RunBudget, RunOutcome, RunStatus};
use crate::store::SharedMigrationStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Created, not started.
    Idle,
    /// Looking for a runnable migration.
    Polling,
    /// Running batches under a lock.
    Working,
    /// Waiting for the next poll.
    Sleeping,
    /// The loop has exited.
    Stopped,
}

/// Notification emitted by the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A migration was claimed and locked by this process.
    Claimed {
        project: String,
        timestamp: String,
        cursor: i64,
    },
    /// A round ended with the migration still incomplete.
    Progress {
        project: String,
        timestamp: String,
        cursor: i64,
        max_value: i64,
        batches: u64,
    },
    /// A migration reached the end of its range.
    Succeeded { project: String, timestamp: String },
    /// A round failed. The loop keeps running.
    RoundFailed {
        project: String,
        timestamp: Option<String>,
        error: String,
    },
    /// A migration exceeded the consecutive failure limit.
    MarkedFailed {
        project: String,
        timestamp: String,
        failures: u32,
    },
}

/// Result of a single scheduling round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Nothing runnable.
    Idle,
    /// The oldest runnable migration has no handler in this process.
    Unrecognized { timestamp: String },
    /// Another process holds the migration's lock.
    LockBusy { timestamp: String },
    /// The lock lapsed mid-round and work stopped.
    LockLost { timestamp: String },
    /// Batches ran under the lock.
    Worked { timestamp: String, outcome: RunOutcome },
    /// The migration's batches failed.
    Failed { timestamp: String, error: String },
}

impl RoundOutcome {
    /// Check if the loop should poll again without sleeping.
    pub fn is_productive(&self) -> bool {
        match self {
            RoundOutcome::Worked { outcome, .. } => outcome.made_progress(),
            _ => false,
        }
    }
}

struct SchedulerInner {
    config: MigratorConfig,
    store: SharedMigrationStore,
    locks: SharedLockService,
    registry: Arc<MigrationRegistry>,
    runner: BatchRunner,
    state: watch::Sender<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    /// Consecutive failed rounds keyed by record id.
    failures: Mutex<HashMap<i64, u32>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Scheduling loop for one project.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    running: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(
        config: MigratorConfig,
        store: SharedMigrationStore,
        locks: SharedLockService,
        registry: Arc<MigrationRegistry>,
    ) -> Self {
        let runner = BatchRunner::new(Arc::clone(&store)).with_batch_delay(config.batch_delay);
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                locks,
                registry,
                runner,
                state,
                events,
                failures: Mutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Current loop state.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Watch loop state changes.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to loop events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Check if the loop task is running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Run one round outside the background loop.
    pub async fn run_round(&self) -> Result<RoundOutcome, Error> {
        self.inner.run_round(&CancellationToken::new()).await
    }

    /// Spawn the background loop.
    ///
    /// Returns false if it is already running. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), cancel.clone()));
        *running = Some(RunningLoop { cancel, handle });
        true
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// A round in progress finishes its current batch first. No lock is
    /// taken by this scheduler after this returns.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Scheduler task panicked");
            self.inner.set_state(SchedulerState::Stopped);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("project", &self.inner.config.project)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, cancel: CancellationToken) {
    let project = inner.config.project.clone();
    info!(
        %project,
        poll_interval_secs = inner.config.poll_interval.as_secs(),
        round_budget_secs = inner.config.round_budget.as_secs(),
        "Batched migration scheduler started"
    );

    while !cancel.is_cancelled() {
        inner.set_state(SchedulerState::Polling);

        // A panicking handler takes down its round, not the loop.
        let round = tokio::spawn({
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            async move { inner.run_round(&cancel).await }
        });

        let productive = match round.await {
            Ok(Ok(outcome)) => outcome.is_productive(),
            Ok(Err(e)) => {
                inner.report_failure(None, &e.to_string());
                false
            }
            Err(e) => {
                inner.report_failure(None, &format!("round panicked: {}", e));
                false
            }
        };

        if productive || cancel.is_cancelled() {
            continue;
        }

        inner.set_state(SchedulerState::Sleeping);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    inner.set_state(SchedulerState::Stopped);
    info!(%project, "Batched migration scheduler stopped");
}

impl SchedulerInner {
    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report_failure(&self, timestamp: Option<&str>, error: &str) {
        error!(
            project = %self.config.project,
            timestamp = timestamp.unwrap_or("-"),
            %error,
            "Batched migration round failed"
        );
        self.emit(SchedulerEvent::RoundFailed {
            project: self.config.project.clone(),
            timestamp: timestamp.map(str::to_string),
            error: error.to_string(),
        });
    }

    async fn run_round(&self, cancel: &CancellationToken) -> Result<RoundOutcome, Error> {
        let project = &self.config.project;

        let Some(record) = self.store.select_or_start_runnable(project).await? else {
            debug!(%project, "no runnable batched migration");
            return Ok(RoundOutcome::Idle);
        };

        let Some(migration) = self.registry.resolve(&record.timestamp) else {
            debug!(
                %project,
                timestamp = %record.timestamp,
                "runnable migration not known to this process"
            );
            return Ok(RoundOutcome::Unrecognized {
                timestamp: record.timestamp,
            });
        };

        let Some(lease) = lock::try_lock(&self.locks, &record.lock_key()).await? else {
            debug!(%project, timestamp = %record.timestamp, "migration locked elsewhere");
            return Ok(RoundOutcome::LockBusy {
                timestamp: record.timestamp,
            });
        };

        self.set_state(SchedulerState::Working);
        let result = self.work_locked(record.id, migration, &lease, cancel).await;

        if let Err(e) = lease.release().await {
            warn!(key = %record.lock_key(), error = %e, "Failed to release migration lock");
        }
        result
    }

    async fn work_locked(
        &self,
        id: i64,
        migration: &RegisteredMigration,
        lease: &LockLease,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, Error> {
        // The claim happened before the lock; another holder may have moved
        // the cursor or status since.
        let record = self.store.select_by_id(id).await?;
        if !record.status.is_runnable() {
            debug!(
                timestamp = %record.timestamp,
                status = %record.status,
                "migration no longer runnable"
            );
            return Ok(RoundOutcome::Idle);
        }

        self.emit(SchedulerEvent::Claimed {
            project: record.project.clone(),
            timestamp: record.timestamp.clone(),
            cursor: record.cursor,
        });

        let budget = RunBudget::time_boxed(self.config.round_budget);
        let round_cancel = lease.guard(cancel);
        let _unlink = round_cancel.clone().drop_guard();
        let result = self
            .runner
            .run(&record, migration.handler.as_ref(), budget, &round_cancel)
            .await;

        if lease.is_lost() {
            let lost = Error::LockLost {
                key: lease.key().to_string(),
            };
            self.report_failure(Some(&record.timestamp), &lost.to_string());
            return Ok(RoundOutcome::LockLost {
                timestamp: record.timestamp,
            });
        }

        match result {
            Ok(outcome) => {
                self.failures.lock().remove(&record.id);
                self.report_progress(&record, &outcome);
                Ok(RoundOutcome::Worked {
                    timestamp: record.timestamp,
                    outcome,
                })
            }
            Err(e) => {
                let error = e.to_string();
                self.report_failure(Some(&record.timestamp), &error);
                self.count_failure(&record).await?;
                Ok(RoundOutcome::Failed {
                    timestamp: record.timestamp,
                    error,
                })
            }
        }
    }

    fn report_progress(&self, record: &MigrationRecord, outcome: &RunOutcome) {
        if outcome.status == RunStatus::Completed {
            self.emit(SchedulerEvent::Succeeded {
                project: record.project.clone(),
                timestamp: record.timestamp.clone(),
            });
            return;
        }

        info!(
            timestamp = %record.timestamp,
            batches = outcome.batches,
            cursor = outcome.cursor,
            max_value = record.max_value,
            "Batched migration round finished"
        );
        self.emit(SchedulerEvent::Progress {
            project: record.project.clone(),
            timestamp: record.timestamp.clone(),
            cursor: outcome.cursor,
            max_value: record.max_value,
            batches: outcome.batches,
        });
    }

    async fn count_failure(&self, record: &MigrationRecord) -> Result<(), Error> {
        let Some(limit) = self.config.max_consecutive_failures else {
            return Ok(());
        };

        let failures = {
            let mut counts = self.failures.lock();
            let count = counts.entry(record.id).or_insert(0);
            *count += 1;
            *count
        };
        if failures < limit {
            return Ok(());
        }

        self.store
            .update_status(record.id, MigrationStatus::Failed)
            .await?;
        self.failures.lock().remove(&record.id);

        error!(
            timestamp = %record.timestamp,
            failures,
            "Batched migration marked failed"
        );
        self.emit(SchedulerEvent::MarkedFailed {
            project: record.project.clone(),
            timestamp: record.timestamp.clone(),
            failures,
        });
        Ok(())
    }
}
