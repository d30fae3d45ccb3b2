//! Retrying decorators over backend trait objects.
//!
//! spec.md requires every backend operation to retry a
//! `SopError::BackendTransient` failure with Fibonacci backoff before it
//! ever reaches the transaction core (see [`sop_core::retry::RetryPolicy`]).
//! These wrappers are how that requirement gets applied: each one holds a
//! concrete backend behind its own trait object and re-runs an operation
//! through a `RetryPolicy` on transient failure, so the wrapped backend is a
//! drop-in `Arc<dyn BlobStore>` / `Arc<dyn Registry>` / `Arc<dyn L2Cache>`
//! with retry behavior attached. `TransactionManager::open_or_create` in
//! `sop-concurrency` applies these to every `Backends` it's handed and feeds
//! the optional `on_retry` hook into its own retry counter, since this crate
//! has no dependency on `sop-concurrency`'s metrics.

use sop_core::error::Result;
use sop_core::handle::Handle;
use sop_core::ids::{LogicalId, PhysicalId};
use sop_core::retry::RetryPolicy;
use sop_core::traits::{BlobStore, L2Cache, Registry};
use std::sync::Arc;

/// Called once per re-attempt, right before the backoff sleep.
type OnRetry = Arc<dyn Fn() + Send + Sync>;

fn noop_on_retry() -> OnRetry {
    Arc::new(|| {})
}

/// Retries a wrapped [`BlobStore`]'s operations on `BackendTransient` failures.
pub struct RetryingBlobStore {
    inner: Arc<dyn BlobStore>,
    policy: RetryPolicy,
    on_retry: OnRetry,
}

impl RetryingBlobStore {
    /// Wrap `inner`, retrying with `policy`'s attempt budget.
    pub fn new(inner: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            on_retry: noop_on_retry(),
        }
    }

    /// As [`Self::new`], also calling `on_retry` on each re-attempt.
    pub fn with_on_retry(inner: Arc<dyn BlobStore>, policy: RetryPolicy, on_retry: OnRetry) -> Self {
        Self {
            inner,
            policy,
            on_retry,
        }
    }
}

impl BlobStore for RetryingBlobStore {
    fn get(&self, table: &str, id: PhysicalId) -> Result<Option<Vec<u8>>> {
        self.policy
            .run_with_on_retry(|| self.inner.get(table, id), || (self.on_retry)())
    }

    fn put(&self, table: &str, id: PhysicalId, bytes: Vec<u8>) -> Result<()> {
        self.policy.run_with_on_retry(
            || self.inner.put(table, id, bytes.clone()),
            || (self.on_retry)(),
        )
    }

    fn delete(&self, table: &str, id: PhysicalId) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.delete(table, id), || (self.on_retry)())
    }
}

/// Retries a wrapped [`Registry`]'s operations on `BackendTransient` failures.
pub struct RetryingRegistry {
    inner: Arc<dyn Registry>,
    policy: RetryPolicy,
    on_retry: OnRetry,
}

impl RetryingRegistry {
    /// Wrap `inner`, retrying with `policy`'s attempt budget.
    pub fn new(inner: Arc<dyn Registry>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            on_retry: noop_on_retry(),
        }
    }

    /// As [`Self::new`], also calling `on_retry` on each re-attempt.
    pub fn with_on_retry(inner: Arc<dyn Registry>, policy: RetryPolicy, on_retry: OnRetry) -> Self {
        Self {
            inner,
            policy,
            on_retry,
        }
    }
}

impl Registry for RetryingRegistry {
    fn get(&self, table: &str, id: LogicalId) -> Result<Option<Handle>> {
        self.policy
            .run_with_on_retry(|| self.inner.get(table, id), || (self.on_retry)())
    }

    fn get_many(&self, table: &str, ids: &[LogicalId]) -> Result<Vec<Option<Handle>>> {
        self.policy
            .run_with_on_retry(|| self.inner.get_many(table, ids), || (self.on_retry)())
    }

    fn put(&self, table: &str, handle: Handle) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.put(table, handle), || (self.on_retry)())
    }

    fn put_many(&self, table: &str, handles: &[Handle]) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.put_many(table, handles), || (self.on_retry)())
    }

    fn delete(&self, table: &str, id: LogicalId) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.delete(table, id), || (self.on_retry)())
    }
}

/// Retries a wrapped [`L2Cache`]'s operations on `BackendTransient` failures.
///
/// `try_lock`/`unlock` themselves are not retried on *contention* — `Ok(false)`
/// is a normal outcome, not a transient error — only a genuine backend error
/// from the underlying cache call (e.g. a network error against a real
/// shared cache) triggers a retry here.
pub struct RetryingL2Cache {
    inner: Arc<dyn L2Cache>,
    policy: RetryPolicy,
    on_retry: OnRetry,
}

impl RetryingL2Cache {
    /// Wrap `inner`, retrying with `policy`'s attempt budget.
    pub fn new(inner: Arc<dyn L2Cache>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            on_retry: noop_on_retry(),
        }
    }

    /// As [`Self::new`], also calling `on_retry` on each re-attempt.
    pub fn with_on_retry(inner: Arc<dyn L2Cache>, policy: RetryPolicy, on_retry: OnRetry) -> Self {
        Self {
            inner,
            policy,
            on_retry,
        }
    }
}

impl L2Cache for RetryingL2Cache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.policy
            .run_with_on_retry(|| self.inner.get(key), || (self.on_retry)())
    }

    fn put(&self, key: &str, bytes: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        self.policy.run_with_on_retry(
            || self.inner.put(key, bytes.clone(), ttl_seconds),
            || (self.on_retry)(),
        )
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.invalidate(key), || (self.on_retry)())
    }

    fn try_lock(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        self.policy
            .run_with_on_retry(|| self.inner.try_lock(key, ttl_seconds), || (self.on_retry)())
    }

    fn unlock(&self, key: &str) -> Result<()> {
        self.policy
            .run_with_on_retry(|| self.inner.unlock(key), || (self.on_retry)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::error::SopError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// A `BlobStore` that fails transiently a fixed number of times, then
    /// delegates to an in-memory map.
    struct FlakyBlobStore {
        fail_remaining: AtomicU32,
        inner: Mutex<std::collections::HashMap<(String, PhysicalId), Vec<u8>>>,
    }

    impl FlakyBlobStore {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_remaining: AtomicU32::new(fail_times),
                inner: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(SopError::BackendTransient("flaky".into()));
            }
            Ok(())
        }
    }

    impl BlobStore for FlakyBlobStore {
        fn get(&self, table: &str, id: PhysicalId) -> Result<Option<Vec<u8>>> {
            self.maybe_fail()?;
            Ok(self.inner.lock().unwrap().get(&(table.to_string(), id)).cloned())
        }

        fn put(&self, table: &str, id: PhysicalId, bytes: Vec<u8>) -> Result<()> {
            self.maybe_fail()?;
            self.inner.lock().unwrap().insert((table.to_string(), id), bytes);
            Ok(())
        }

        fn delete(&self, table: &str, id: PhysicalId) -> Result<()> {
            self.maybe_fail()?;
            self.inner.lock().unwrap().remove(&(table.to_string(), id));
            Ok(())
        }
    }

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::with_jitter(
            max_attempts,
            Box::new(sop_core::retry::FixedJitter::new(vec![0])),
        )
    }

    #[test]
    fn retrying_blob_store_recovers_from_transient_failures() {
        let flaky: Arc<dyn BlobStore> = Arc::new(FlakyBlobStore::new(2));
        let store = RetryingBlobStore::new(flaky, fast_policy(5));
        let id = PhysicalId::new();
        store.put("t", id, b"hello".to_vec()).unwrap();
        assert_eq!(store.get("t", id).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn retrying_blob_store_gives_up_past_its_budget() {
        let flaky: Arc<dyn BlobStore> = Arc::new(FlakyBlobStore::new(10));
        let store = RetryingBlobStore::new(flaky, fast_policy(3));
        let err = store.get("t", PhysicalId::new()).unwrap_err();
        assert!(matches!(err, SopError::BackendTransient(_)));
    }

    #[test]
    fn retrying_blob_store_invokes_on_retry_hook_per_reattempt() {
        let flaky: Arc<dyn BlobStore> = Arc::new(FlakyBlobStore::new(2));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let hook_calls_clone = Arc::clone(&hook_calls);
        let store = RetryingBlobStore::with_on_retry(
            flaky,
            fast_policy(5),
            Arc::new(move || {
                hook_calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        store.put("t", PhysicalId::new(), b"x".to_vec()).unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retrying_l2_cache_passes_through_lock_contention_without_retrying() {
        let cache: Arc<dyn L2Cache> = Arc::new(crate::l2cache::MemL2Cache::new());
        let retrying = RetryingL2Cache::new(Arc::clone(&cache), fast_policy(5));
        assert!(retrying.try_lock("a", 60).unwrap());
        assert!(!retrying.try_lock("a", 60).unwrap());
    }
}
