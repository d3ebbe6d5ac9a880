//! In-process lock table.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::LockService;
use crate::error::Error;

/// Locks that only exclude holders within this process.
///
/// Suitable for single-process deployments and tests. Share one instance
/// (behind an `Arc`) between everything that must exclude each other.
#[derive(Debug, Default)]
pub struct InProcessLockService {
    held: DashMap<String, Instant>,
}

impl InProcessLockService {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a key is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Number of held locks.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl LockService for InProcessLockService {
    async fn try_acquire(&self, key: &str) -> Result<bool, Error> {
        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        if let Some((_, acquired_at)) = self.held.remove(key) {
            tracing::trace!(%key, held_ms = acquired_at.elapsed().as_millis() as u64, "lock released");
        }
        Ok(())
    }
}
