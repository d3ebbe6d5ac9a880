//! Batch runner.
//!
//! Drives one migration forward batch by batch. Each batch is checkpointed
//! by writing the new cursor to the store: a crash before the write re-runs
//! the batch, a crash after it never repeats it.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::definition::MigrationHandler;
use crate::error::Error;
use crate::record::{MigrationRecord, MigrationStatus};
use crate::store::SharedMigrationStore;

/// Inclusive range of units processed by one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    /// First unit.
    pub start: i64,
    /// Last unit.
    pub end: i64,
}

impl BatchRange {
    /// The batch following `cursor`, or None once the range is exhausted.
    pub fn after(cursor: i64, batch_size: i64, max_value: i64) -> Option<Self> {
        if cursor >= max_value {
            return None;
        }
        let start = cursor + 1;
        let end = cursor.saturating_add(batch_size.max(1)).min(max_value);
        Some(Self { start, end })
    }

    /// Number of units in the batch.
    pub fn len(&self) -> u64 {
        (i128::from(self.end) - i128::from(self.start) + 1) as u64
    }

    /// Always false; a batch holds at least one unit.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Limits on a single runner invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBudget {
    /// Stop starting batches after this much wall-clock time.
    pub max_duration: Option<Duration>,
    /// Stop after this many batches.
    pub max_batches: Option<u64>,
}

impl RunBudget {
    /// Run until the range is exhausted.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Run for at most `duration`.
    pub fn time_boxed(duration: Duration) -> Self {
        Self {
            max_duration: Some(duration),
            max_batches: None,
        }
    }

    /// Also stop after `batches` batches.
    pub fn with_max_batches(mut self, batches: u64) -> Self {
        self.max_batches = Some(batches);
        self
    }

    fn is_exhausted(&self, started: Instant, batches: u64) -> bool {
        self.max_duration
            .map(|limit| started.elapsed() >= limit)
            .unwrap_or(false)
            || self.max_batches.map(|limit| batches >= limit).unwrap_or(false)
    }
}

/// Why the runner returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The range is exhausted and the record is `succeeded`.
    Completed,
    /// The budget ran out; the record keeps its status.
    BudgetExhausted,
    /// Cancellation was requested between batches.
    Cancelled,
}

/// Result of a runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Why the runner returned.
    pub status: RunStatus,
    /// Batches completed during this invocation.
    pub batches: u64,
    /// Cursor after the last checkpoint.
    pub cursor: i64,
}

impl RunOutcome {
    /// Check if the invocation moved the migration forward.
    pub fn made_progress(&self) -> bool {
        self.batches > 0 || self.status == RunStatus::Completed
    }
}

/// Executes batches for one migration at a time.
///
/// The caller must hold the migration's lock.
#[derive(Clone)]
pub struct BatchRunner {
    store: SharedMigrationStore,
    batch_delay: Duration,
}

impl BatchRunner {
    /// Create a runner writing checkpoints to `store`.
    pub fn new(store: SharedMigrationStore) -> Self {
        Self {
            store,
            batch_delay: Duration::ZERO,
        }
    }

    /// Pause between batches to yield to foreground writes.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Run batches until the range is exhausted, the budget runs out or
    /// `cancel` fires.
    ///
    /// A failing batch is not retried; its error is returned and the cursor
    /// stays before it.
    pub async fn run(
        &self,
        record: &MigrationRecord,
        handler: &dyn MigrationHandler,
        budget: RunBudget,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Error> {
        if record.status == MigrationStatus::Succeeded {
            return Ok(RunOutcome {
                status: RunStatus::Completed,
                batches: 0,
                cursor: record.cursor,
            });
        }

        let started = Instant::now();
        let mut cursor = record.cursor;
        let mut batches = 0;

        loop {
            let Some(range) = BatchRange::after(cursor, record.batch_size, record.max_value) else {
                self.store
                    .update_status(record.id, MigrationStatus::Succeeded)
                    .await?;
                tracing::info!(
                    project = %record.project,
                    timestamp = %record.timestamp,
                    migration_id = record.id,
                    cursor,
                    "batched migration succeeded"
                );
                return Ok(RunOutcome {
                    status: RunStatus::Completed,
                    batches,
                    cursor,
                });
            };

            if cancel.is_cancelled() {
                return Ok(RunOutcome {
                    status: RunStatus::Cancelled,
                    batches,
                    cursor,
                });
            }
            if budget.is_exhausted(started, batches) {
                tracing::debug!(
                    timestamp = %record.timestamp,
                    batches,
                    cursor,
                    "run budget exhausted"
                );
                return Ok(RunOutcome {
                    status: RunStatus::BudgetExhausted,
                    batches,
                    cursor,
                });
            }

            handler
                .run_batch(range.start, range.end)
                .await
                .map_err(|source| Error::BatchFailed {
                    timestamp: record.timestamp.clone(),
                    start: range.start,
                    end: range.end,
                    source,
                })?;

            self.store.update_cursor(record.id, range.end).await?;
            cursor = range.end;
            batches += 1;

            tracing::debug!(
                timestamp = %record.timestamp,
                start = range.start,
                end = range.end,
                max_value = record.max_value,
                "batch completed"
            );

            if !self.batch_delay.is_zero() && cursor < record.max_value {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.batch_delay) => {}
                }
            }
        }
    }
}
