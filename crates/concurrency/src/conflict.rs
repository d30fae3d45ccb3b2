//! Lock-key ordering and acquisition for phase-1 commit.
//!
//! Phase-1 commit locks every logical ID it touches, in sorted order, to
//! make lock acquisition deadlock-free across concurrently committing
//! transactions. Keys are locked through the shared
//! [`sop_core::traits::L2Cache`], whose `try_lock` already implements the
//! double-read protocol that makes a single `try_lock` call race-free
//! against a concurrent committer.

use sop_core::error::{Result, SopError};
use sop_core::ids::LogicalId;
use sop_core::traits::L2Cache;
use std::sync::Arc;

/// Build the L2 lock key for `logical_id` within `table`.
pub(crate) fn lock_key(table: &str, logical_id: LogicalId) -> String {
    format!("commit-lock:{table}:{logical_id}")
}

/// Sort `ids` so every caller locking the same set acquires them in the
/// same order, regardless of the order the B-tree algorithm touched them
/// in.
pub(crate) fn sorted_lock_keys(table: &str, ids: &[LogicalId]) -> Vec<String> {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.iter().map(|id| lock_key(table, *id)).collect()
}

/// Acquires a set of commit locks, releasing everything already acquired
/// if any key is already held elsewhere.
///
/// Holds an owned `Arc` rather than borrowing the transaction's L2 cache
/// handle, so a live guard never keeps the owning [`crate::Transaction`]
/// borrowed while it goes on to stage the rest of the commit.
pub(crate) struct LockGuard {
    l2_cache: Arc<dyn L2Cache>,
    ttl_seconds: u64,
    held: Vec<String>,
}

impl LockGuard {
    /// Try to acquire every key in `keys`, in order. On the first failure,
    /// releases everything acquired so far and returns
    /// [`SopError::Conflict`].
    pub(crate) fn acquire(
        l2_cache: Arc<dyn L2Cache>,
        ttl_seconds: u64,
        keys: Vec<String>,
    ) -> Result<Self> {
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            match l2_cache.try_lock(&key, ttl_seconds) {
                Ok(true) => held.push(key),
                Ok(false) => {
                    Self::release_all(l2_cache.as_ref(), &held);
                    return Err(SopError::Conflict(format!(
                        "commit lock already held: {key}"
                    )));
                }
                Err(e) => {
                    Self::release_all(l2_cache.as_ref(), &held);
                    return Err(e);
                }
            }
        }
        Ok(LockGuard {
            l2_cache,
            ttl_seconds,
            held,
        })
    }

    /// Release every lock held by this guard.
    pub(crate) fn release(self) {
        Self::release_all(self.l2_cache.as_ref(), &self.held);
    }

    fn release_all(l2_cache: &dyn L2Cache, keys: &[String]) {
        for key in keys {
            let _ = l2_cache.unlock(key);
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_storage::MemL2Cache;

    #[test]
    fn sorted_lock_keys_are_deterministic_and_deduped() {
        let a = LogicalId::new();
        let b = LogicalId::new();
        let keys1 = sorted_lock_keys("t", &[b, a, a]);
        let keys2 = sorted_lock_keys("t", &[a, b]);
        assert_eq!(keys1, keys2);
        assert_eq!(keys1.len(), 2);
    }

    #[test]
    fn acquire_releases_everything_on_conflict() {
        let l2: Arc<dyn L2Cache> = Arc::new(MemL2Cache::new());
        let a = LogicalId::new();
        let b = LogicalId::new();
        let keys = sorted_lock_keys("t", &[a, b]);
        // Simulate another committer already holding the second key.
        assert!(l2.try_lock(&keys[1], 30).unwrap());

        let result = LockGuard::acquire(l2.clone(), 30, keys.clone());
        assert!(result.is_err());
        // The first key, acquired then rolled back, must be free again.
        assert!(l2.try_lock(&keys[0], 30).unwrap());
    }

    #[test]
    fn acquire_then_release_frees_every_key() {
        let l2: Arc<dyn L2Cache> = Arc::new(MemL2Cache::new());
        let a = LogicalId::new();
        let keys = sorted_lock_keys("t", &[a]);
        let guard = LockGuard::acquire(l2.clone(), 30, keys.clone()).unwrap();
        guard.release();
        assert!(l2.try_lock(&keys[0], 30).unwrap());
    }
}
