//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchmig::{
    Error, HandlerError, LockService, MigrationHandler, MigrationParameters, MigrationRecord,
    MigrationStatus, Migrator, MigratorConfig, SharedMigrationStore, SqliteMigrationStore,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const PROJECT: &str = "app";
pub const BACKFILL: &str = "20230406184103_backfill";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Idempotent handler that records every batch and the units it touched.
pub struct RecordingHandler {
    params: MigrationParameters,
    delay: Duration,
    pub batches: Mutex<Vec<(i64, i64)>>,
    /// Times each unit was processed.
    pub applied: Mutex<BTreeMap<i64, u32>>,
    /// Batch start that fails once after applying its units.
    crash_after_apply: Mutex<Option<i64>>,
    /// Batch start that fails without applying anything.
    pub fail_at: Mutex<Option<i64>>,
    in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(params: MigrationParameters) -> Self {
        Self {
            params,
            delay: Duration::ZERO,
            batches: Mutex::new(Vec::new()),
            applied: Mutex::new(BTreeMap::new()),
            crash_after_apply: Mutex::new(None),
            fail_at: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn crash_once_after(self, start: i64) -> Self {
        *self.crash_after_apply.lock() = Some(start);
        self
    }

    pub fn failing_at(self, start: i64) -> Self {
        *self.fail_at.lock() = Some(start);
        self
    }

    pub fn batches(&self) -> Vec<(i64, i64)> {
        self.batches.lock().clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl MigrationHandler for RecordingHandler {
    async fn parameters(&self) -> Result<MigrationParameters, HandlerError> {
        Ok(self.params)
    }

    async fn run_batch(&self, start: i64, end: i64) -> Result<(), HandlerError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if *self.fail_at.lock() == Some(start) {
            Err(format!("batch starting at {} rejected", start).into())
        } else {
            self.batches.lock().push((start, end));
            let mut applied = self.applied.lock();
            for unit in start..=end {
                *applied.entry(unit).or_insert(0) += 1;
            }
            drop(applied);

            let mut crash = self.crash_after_apply.lock();
            if *crash == Some(start) {
                *crash = None;
                Err("worker crashed before checkpoint".into())
            } else {
                Ok(())
            }
        };

        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

/// Lock service wrapper counting acquisition attempts.
pub struct CountingLocks<L> {
    inner: L,
    pub attempts: AtomicUsize,
}

impl<L> CountingLocks<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<L: LockService> LockService for CountingLocks<L> {
    async fn try_acquire(&self, key: &str) -> Result<bool, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.try_acquire(key).await
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        self.inner.release(key).await
    }

    fn lost_token(&self, key: &str) -> Option<CancellationToken> {
        self.inner.lost_token(key)
    }
}

/// On-disk record store shared by every migrator of a test.
pub struct TestContext {
    dir: tempfile::TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("batched_migrations.db")
    }

    /// A fresh connection, as another process would open.
    pub fn store(&self) -> SharedMigrationStore {
        Arc::new(SqliteMigrationStore::open(self.db_path()).unwrap())
    }

    pub fn config(&self) -> MigratorConfig {
        MigratorConfig::new(PROJECT)
            .with_poll_interval(Duration::from_millis(20))
            .with_round_budget(Duration::from_millis(50))
            .with_lock_retry_interval(Duration::from_millis(5))
    }

    pub fn migrator(
        &self,
        config: MigratorConfig,
        locks: Arc<dyn LockService>,
        handler: Arc<RecordingHandler>,
    ) -> Migrator {
        let registry = batchmig::MigrationRegistry::new()
            .with(format!("{}.rs", BACKFILL), handler)
            .unwrap();
        Migrator::new(config, self.store(), locks, registry)
    }
}

/// Poll until the record reaches `status`.
pub async fn wait_for_status(
    migrator: &Migrator,
    identifier: &str,
    status: MigrationStatus,
) -> MigrationRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = migrator.status(identifier).await.unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}", identifier, status))
}
