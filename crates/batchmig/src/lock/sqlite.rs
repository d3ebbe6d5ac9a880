//! Lease locks stored in a SQLite table.
//!
//! Every process opening the same database file shares the lock table. A
//! holder keeps its lease alive with a heartbeat; if the holder dies the
//! lease lapses after its TTL and the lock becomes free.
//!
//! A heartbeat that cannot renew before the lease expires (a stalled
//! runtime, an unreachable database file) cancels the lease's lost token;
//! the holder must stop work because another process may take over.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use tokio_util::sync::CancellationToken;

use super::LockService;
use crate::error::Error;

/// Default lease lifetime without a heartbeat.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batched_migration_locks (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

fn new_holder_id() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
    )
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

struct Heartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
}

/// Lease-based locks on a SQLite database file.
pub struct SqliteLeaseLockService {
    conn: Arc<Mutex<Connection>>,
    holder: String,
    ttl: Duration,
    heartbeats: DashMap<String, Heartbeat>,
}

impl SqliteLeaseLockService {
    /// Open the lock table at `path` with the default lease TTL.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_ttl(path, DEFAULT_LEASE_TTL)
    }

    /// Open the lock table at `path` with a specific lease TTL.
    pub fn open_with_ttl(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            holder: new_holder_id(),
            ttl,
            heartbeats: DashMap::new(),
        })
    }

    /// Identifier written into rows this service holds.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// The lease TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_millis(&self) -> i64 {
        self.ttl.as_millis().min(i64::MAX as u128) as i64
    }

    async fn with_conn<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, Error> + Send + 'static,
    {
        let conn = Arc::clone(conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    fn spawn_heartbeat(&self, key: String, expires_at: i64) {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let heartbeat = Heartbeat {
            stop: stop.clone(),
            lost: lost.clone(),
        };
        if let Some(previous) = self.heartbeats.insert(key.clone(), heartbeat) {
            previous.stop.cancel();
        }

        let conn = Arc::clone(&self.conn);
        let holder = self.holder.clone();
        let ttl_millis = self.ttl_millis();
        let interval = (self.ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut expires_at = expires_at;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let key_for_update = key.clone();
                let holder = holder.clone();
                let renewed = Self::with_conn(&conn, move |conn| {
                    let now = now_millis();
                    let renewed_until = now + ttl_millis;
                    // An expired lease is free for the taking even if no one
                    // has taken it yet.
                    let updated = conn.execute(
                        "UPDATE batched_migration_locks SET expires_at = ?3 \
                         WHERE key = ?1 AND holder = ?2 AND expires_at > ?4",
                        params![key_for_update, holder, renewed_until, now],
                    )?;
                    Ok((updated == 1).then_some(renewed_until))
                })
                .await;

                match renewed {
                    Ok(Some(until)) => {
                        expires_at = until;
                        tracing::trace!(%key, "lease renewed");
                    }
                    Ok(None) => {
                        tracing::warn!(%key, "lease lost before release");
                        lost.cancel();
                        break;
                    }
                    Err(e) if now_millis() >= expires_at => {
                        tracing::warn!(%key, error = %e, "lease expired while renewal failing");
                        lost.cancel();
                        break;
                    }
                    Err(e) => tracing::warn!(%key, error = %e, "failed to renew lease"),
                }
            }
        });
    }
}

impl std::fmt::Debug for SqliteLeaseLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLeaseLockService")
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("held", &self.heartbeats.len())
            .finish()
    }
}

#[async_trait]
impl LockService for SqliteLeaseLockService {
    async fn try_acquire(&self, key: &str) -> Result<bool, Error> {
        let owned_key = key.to_string();
        let holder = self.holder.clone();
        let ttl_millis = self.ttl_millis();

        let acquired = Self::with_conn(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();
            let expires_at = now + ttl_millis;
            let changed = tx.execute(
                "INSERT INTO batched_migration_locks (key, holder, expires_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, \
                     expires_at = excluded.expires_at \
                 WHERE batched_migration_locks.expires_at <= ?4",
                params![owned_key, holder, expires_at, now],
            )?;
            tx.commit()?;
            Ok((changed == 1).then_some(expires_at))
        })
        .await?;

        match acquired {
            Some(expires_at) => {
                tracing::debug!(%key, holder = %self.holder, "lease acquired");
                self.spawn_heartbeat(key.to_string(), expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        if let Some((_, heartbeat)) = self.heartbeats.remove(key) {
            heartbeat.stop.cancel();
        }

        let owned_key = key.to_string();
        let holder = self.holder.clone();
        Self::with_conn(&self.conn, move |conn| {
            conn.execute(
                "DELETE FROM batched_migration_locks WHERE key = ?1 AND holder = ?2",
                params![owned_key, holder],
            )?;
            Ok(())
        })
        .await
    }

    fn lost_token(&self, key: &str) -> Option<CancellationToken> {
        self.heartbeats
            .get(key)
            .map(|heartbeat| heartbeat.lost.clone())
    }
}

impl Drop for SqliteLeaseLockService {
    fn drop(&mut self) {
        for entry in self.heartbeats.iter() {
            entry.value().stop.cancel();
        }
    }
}
