//! PostgreSQL session advisory locks.
//!
//! Enable with `--features postgres`.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;

use super::LockService;
use crate::error::Error;

/// Map a lock key onto the 64-bit advisory lock space.
pub fn advisory_key(key: &str) -> i64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// Advisory locks held on dedicated pooled connections.
///
/// Session-level advisory locks belong to the connection that took them,
/// so each held lock pins its connection until release. If the process
/// dies the session ends and Postgres drops the lock.
pub struct PgAdvisoryLockService {
    pool: PgPool,
    held: DashMap<String, PoolConnection<Postgres>>,
}

impl PgAdvisoryLockService {
    /// Create a lock service on a pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: DashMap::new(),
        }
    }
}

#[async_trait]
impl LockService for PgAdvisoryLockService {
    async fn try_acquire(&self, key: &str) -> Result<bool, Error> {
        if self.held.contains_key(key) {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_key(key))
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            tracing::debug!(%key, "advisory lock acquired");
            self.held.insert(key.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        let Some((_, mut conn)) = self.held.remove(key) else {
            return Ok(());
        };

        let released: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(advisory_key(key))
                .fetch_one(&mut *conn)
                .await;
        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(%key, "advisory lock was not held by its session");
                Ok(())
            }
            Err(e) => {
                // The session may still hold the lock; ending it releases
                // the lock and keeps the connection out of the pool.
                if let Err(close_err) = conn.close().await {
                    tracing::warn!(%key, error = %close_err, "failed to close lock connection");
                }
                Err(e.into())
            }
        }
    }
}
