//! Fleet-wide named locks.
//!
//! A migration's cursor may only be advanced by the process holding the
//! lock named by [`lock_key`]. The record store's `running` status is a
//! scheduling hint, never a substitute for the lock.

mod memory;
mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InProcessLockService;
pub use sqlite::{SqliteLeaseLockService, DEFAULT_LEASE_TTL};

#[cfg(feature = "postgres")]
pub use postgres::PgAdvisoryLockService;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Namespace prefix of migration lock keys.
pub const LOCK_NAMESPACE: &str = "batched-migrations";

/// Lock key for a project's migration.
pub fn lock_key(project: &str, timestamp: &str) -> String {
    format!("{}:{}:{}", LOCK_NAMESPACE, project, timestamp)
}

/// Named, non-reentrant advisory locks.
///
/// Implementations must release a lock when its holder process dies.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock without waiting.
    ///
    /// Returns `false` if anyone holds it, including this service.
    async fn try_acquire(&self, key: &str) -> Result<bool, Error>;

    /// Release a lock taken through this service.
    async fn release(&self, key: &str) -> Result<(), Error>;

    /// Token cancelled if a lock held by this service lapses before release.
    ///
    /// Services whose locks cannot lapse while held return `None`.
    fn lost_token(&self, _key: &str) -> Option<CancellationToken> {
        None
    }
}

/// Thread-safe lock service handle.
pub type SharedLockService = Arc<dyn LockService>;

/// A held lock.
///
/// Call [`release`](Self::release) when done. A lease dropped without an
/// explicit release (panic, task abort) is released on a spawned task.
pub struct LockLease {
    locks: SharedLockService,
    key: String,
    lost: Option<CancellationToken>,
    released: bool,
}

impl LockLease {
    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check if the lock service reported the lock lost.
    pub fn is_lost(&self) -> bool {
        self.lost.as_ref().map_or(false, |lost| lost.is_cancelled())
    }

    /// A child of `parent` that is also cancelled if the lock is lost.
    ///
    /// Cancel the returned token once the guarded work is done.
    pub fn guard(&self, parent: &CancellationToken) -> CancellationToken {
        let guarded = parent.child_token();
        match self.lost.clone() {
            Some(lost) if lost.is_cancelled() => guarded.cancel(),
            Some(lost) => {
                let linked = guarded.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = lost.cancelled() => linked.cancel(),
                        _ = linked.cancelled() => {}
                    }
                });
            }
            None => {}
        }
        guarded
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.locks.release(&self.key).await
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("lost", &self.is_lost())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = Arc::clone(&self.locks);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = locks.release(&key).await {
                        tracing::warn!(%key, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => tracing::warn!(%key, "lock dropped outside a runtime, not released"),
        }
    }
}

/// Take a lock if it is free.
pub async fn try_lock(locks: &SharedLockService, key: &str) -> Result<Option<LockLease>, Error> {
    if !locks.try_acquire(key).await? {
        return Ok(None);
    }
    Ok(Some(LockLease {
        locks: Arc::clone(locks),
        key: key.to_string(),
        lost: locks.lost_token(key),
        released: false,
    }))
}

/// Wait for a lock, retrying every `retry_interval` until `timeout`.
pub async fn lock_with_timeout(
    locks: &SharedLockService,
    key: &str,
    timeout: Duration,
    retry_interval: Duration,
) -> Result<LockLease, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(lease) = try_lock(locks, key).await? {
            return Ok(lease);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::LockTimeout {
                key: key.to_string(),
            });
        }
        tracing::debug!(%key, "lock busy, retrying");
        tokio::time::sleep(retry_interval.min(deadline - now)).await;
    }
}

/// Run `f` while holding the lock.
///
/// Returns `Ok(None)` without running `f` if the lock is held elsewhere.
/// The lock is released whatever `f` returns.
pub async fn with_lock<T, F, Fut>(
    locks: &SharedLockService,
    key: &str,
    f: F,
) -> Result<Option<T>, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(lease) = try_lock(locks, key).await? else {
        return Ok(None);
    };
    let output = f().await;
    if let Err(e) = lease.release().await {
        tracing::warn!(%key, error = %e, "failed to release lock");
    }
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SharedLockService {
        Arc::new(InProcessLockService::new())
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(
            lock_key("app", "20230406184103"),
            "batched-migrations:app:20230406184103"
        );
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let locks = service();
        let key = lock_key("app", "20230406184103");

        let out = with_lock(&locks, &key, || async { 42 }).await.unwrap();
        assert_eq!(out, Some(42));
        assert!(locks.try_acquire(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let locks = service();
        let key = lock_key("app", "20230406184103");
        let _held = try_lock(&locks, &key).await.unwrap().unwrap();

        let mut ran = false;
        let out = with_lock(&locks, &key, || {
            ran = true;
            async {}
        })
        .await
        .unwrap();
        assert!(out.is_none());
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let locks = service();
        let key = lock_key("app", "20230406184103");

        let lease = try_lock(&locks, &key).await.unwrap().unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(try_lock(&locks, &key).await.unwrap().is_some());
    }

    /// Lock service whose leases can be revoked by the test.
    struct Revocable {
        inner: InProcessLockService,
        lost: CancellationToken,
    }

    #[async_trait]
    impl LockService for Revocable {
        async fn try_acquire(&self, key: &str) -> Result<bool, Error> {
            self.inner.try_acquire(key).await
        }

        async fn release(&self, key: &str) -> Result<(), Error> {
            self.inner.release(key).await
        }

        fn lost_token(&self, _key: &str) -> Option<CancellationToken> {
            Some(self.lost.clone())
        }
    }

    #[tokio::test]
    async fn test_guard_cancelled_when_lock_lost() {
        let lost = CancellationToken::new();
        let locks: SharedLockService = Arc::new(Revocable {
            inner: InProcessLockService::new(),
            lost: lost.clone(),
        });
        let lease = try_lock(&locks, "k").await.unwrap().unwrap();
        let parent = CancellationToken::new();
        let guarded = lease.guard(&parent);
        assert!(!lease.is_lost());
        assert!(!guarded.is_cancelled());

        lost.cancel();
        tokio::time::timeout(Duration::from_secs(1), guarded.cancelled())
            .await
            .unwrap();
        assert!(lease.is_lost());
        assert!(!parent.is_cancelled());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_follows_parent() {
        let locks = service();
        let lease = try_lock(&locks, "k").await.unwrap().unwrap();
        let parent = CancellationToken::new();
        let guarded = lease.guard(&parent);

        parent.cancel();
        assert!(guarded.is_cancelled());
        assert!(!lease.is_lost());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_with_timeout_waits_for_release() {
        let locks = service();
        let key = lock_key("app", "20230406184103");
        let lease = try_lock(&locks, &key).await.unwrap().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            lease.release().await.unwrap();
        });

        let acquired = lock_with_timeout(
            &locks,
            &key,
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert_eq!(acquired.key(), key);
    }

    #[tokio::test]
    async fn test_lock_with_timeout_gives_up() {
        let locks = service();
        let key = lock_key("app", "20230406184103");
        let _held = try_lock(&locks, &key).await.unwrap().unwrap();

        let err = lock_with_timeout(
            &locks,
            &key,
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }
}
