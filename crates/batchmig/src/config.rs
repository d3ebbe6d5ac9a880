//! Migrator configuration.

use std::time::Duration;

/// Default project namespace.
pub const DEFAULT_PROJECT: &str = "default";

/// Default number of units per batch.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Default first unit of a range.
pub const DEFAULT_MIN_VALUE: i64 = 1;

/// Default idle sleep between polls in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default wall-clock budget per scheduling round in seconds.
pub const DEFAULT_ROUND_BUDGET_SECS: u64 = 60;

/// Default time `finalize` waits for a busy lock in seconds.
pub const DEFAULT_FINALIZE_LOCK_TIMEOUT_SECS: u64 = 300;

/// Default delay between lock acquisition attempts in milliseconds.
pub const DEFAULT_LOCK_RETRY_MILLIS: u64 = 500;

/// Configuration shared by the scheduler and the control surface.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Project namespace records are scoped to.
    pub project: String,

    /// Batch size used when a definition does not report one.
    pub default_batch_size: i64,

    /// Range start used when a definition does not report one.
    pub default_min_value: i64,

    /// Sleep between polls when a round did no work.
    pub poll_interval: Duration,

    /// Wall-clock budget given to the batch runner per round.
    pub round_budget: Duration,

    /// Pause between consecutive batches. Zero disables it.
    pub batch_delay: Duration,

    /// How long `finalize` waits for a lock held elsewhere.
    pub finalize_lock_timeout: Duration,

    /// Delay between lock attempts while `finalize` waits.
    pub lock_retry_interval: Duration,

    /// Consecutive failed rounds after which a migration is marked failed.
    /// None keeps retrying forever.
    pub max_consecutive_failures: Option<u32>,
}

impl MigratorConfig {
    /// Create a configuration for the given project.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_min_value: DEFAULT_MIN_VALUE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            round_budget: Duration::from_secs(DEFAULT_ROUND_BUDGET_SECS),
            batch_delay: Duration::ZERO,
            finalize_lock_timeout: Duration::from_secs(DEFAULT_FINALIZE_LOCK_TIMEOUT_SECS),
            lock_retry_interval: Duration::from_millis(DEFAULT_LOCK_RETRY_MILLIS),
            max_consecutive_failures: None,
        }
    }

    /// Set the default batch size.
    pub fn with_default_batch_size(mut self, batch_size: i64) -> Self {
        self.default_batch_size = batch_size.max(1);
        self
    }

    /// Set the default range start.
    pub fn with_default_min_value(mut self, min_value: i64) -> Self {
        self.default_min_value = min_value;
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-round time budget.
    pub fn with_round_budget(mut self, budget: Duration) -> Self {
        self.round_budget = budget;
        self
    }

    /// Set the pause between batches.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Set how long finalize waits for the lock.
    pub fn with_finalize_lock_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_lock_timeout = timeout;
        self
    }

    /// Set the delay between lock attempts.
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Mark migrations failed after this many consecutive failed rounds.
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = Some(failures.max(1));
        self
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROJECT)
    }
}
