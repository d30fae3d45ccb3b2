//! Store lifecycle and transaction issuance.
//!
//! A [`TransactionManager`] is the one long-lived object an application
//! holds per store: it owns the backend handles every transaction against
//! that store commits through, and the shared [`TransactionMetrics`]
//! counters every transaction it issues reports into.

use crate::metrics::{MetricsSnapshot, TransactionMetrics};
use crate::transaction::{Backends, Transaction, TransactionMode};
use sop_core::error::{Result, SopError};
use sop_core::ids::LogicalId;
use sop_core::retry::RetryPolicy;
use sop_core::store_info::{StoreInfo, StoreOptions};
use sop_core::time::now_micros;
use sop_storage::{RetryingBlobStore, RetryingL2Cache, RetryingRegistry};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens or creates a store, and issues [`Transaction`]s against it.
///
/// Re-opening a name that already exists validates the caller's options
/// against what's stored via `StoreOptions::matches`: a mismatch fails with
/// [`SopError::ConfigMismatch`] rather than silently adopting the caller's
/// options.
pub struct TransactionManager {
    backends: Backends,
    store: StoreInfo,
    metrics: Arc<TransactionMetrics>,
}

impl TransactionManager {
    /// Open an existing store by name, or create it with `options` if this
    /// is the first open. Fails with [`SopError::ConfigMismatch`] if the
    /// store already exists under different options.
    pub fn open_or_create(
        name: &str,
        options: StoreOptions,
        backends: Backends,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(SopError::ConfigMismatch)?;

        let store = match backends.store_repo.get(name)? {
            Some(existing) => {
                if !existing.options().matches(&options) {
                    return Err(SopError::ConfigMismatch(format!(
                        "store '{name}' already exists with incompatible options"
                    )));
                }
                debug!(store = name, "reopened existing store");
                existing
            }
            None => {
                let empty_root = LogicalId::new();
                let info = StoreInfo::new(name, &options, empty_root, now_micros());
                backends.store_repo.create(info.clone())?;
                info!(store = name, "created new store");
                info
            }
        };

        let metrics = Arc::new(TransactionMetrics::new());
        let backends = Self::wrap_with_retry(backends, &metrics);

        Ok(TransactionManager {
            backends,
            store,
            metrics,
        })
    }

    /// Wrap the Blob Store, Registry, and L2 Cache backends in a retrying
    /// decorator (see `sop_storage::retrying`) so `SopError::BackendTransient`
    /// failures are retried with Fibonacci backoff before they ever reach a
    /// transaction, per spec.md's retry policy. Applied once, here, rather
    /// than inside each backend crate, since this is the one place that
    /// holds both a fresh `Backends` and this store's `TransactionMetrics` —
    /// `sop-storage` has no dependency on this crate's metrics counters.
    fn wrap_with_retry(mut backends: Backends, metrics: &Arc<TransactionMetrics>) -> Backends {
        let metrics_for_hook = Arc::clone(metrics);
        let on_retry: Arc<dyn Fn() + Send + Sync> =
            Arc::new(move || metrics_for_hook.record_retry());

        backends.registry = Arc::new(RetryingRegistry::with_on_retry(
            backends.registry,
            RetryPolicy::default(),
            Arc::clone(&on_retry),
        ));
        backends.blob_store = Arc::new(RetryingBlobStore::with_on_retry(
            backends.blob_store,
            RetryPolicy::default(),
            Arc::clone(&on_retry),
        ));
        backends.l2_cache = Arc::new(RetryingL2Cache::with_on_retry(
            backends.l2_cache,
            RetryPolicy::default(),
            on_retry,
        ));
        backends
    }

    /// Begin a new transaction against this manager's store, re-reading
    /// the store's current root and count so the transaction starts from
    /// an up-to-date snapshot.
    pub fn begin(&mut self, mode: TransactionMode) -> Result<Transaction> {
        if let Some(latest) = self.backends.store_repo.get(&self.store.name)? {
            self.store = latest;
        }
        debug!(store = %self.store.name, mode = ?mode, "beginning transaction");
        Ok(Transaction::begin(
            mode,
            &self.store,
            self.cache_config(),
            self.backends.clone(),
            self.metrics.clone(),
        ))
    }

    /// Logical id of the tree's current root, as last observed.
    pub fn root(&self) -> LogicalId {
        self.store.root_node_logical_id
    }

    /// This manager's store metadata, as last observed.
    pub fn store_info(&self) -> &StoreInfo {
        &self.store
    }

    /// Snapshot of every transaction this manager has issued.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn cache_config(&self) -> sop_core::store_info::CacheConfig {
        // StoreInfo doesn't persist cache_config; each open supplies its
        // own, so reuse the default rather than inventing a per-store
        // override surface.
        sop_core::store_info::CacheConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::handle::Handle;
    use sop_core::traits::Registry;
    use sop_durability::MemTransactionLog;
    use sop_storage::{MemBlobStore, MemL2Cache, MemRegistry, MemStoreRepository};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A `Registry` that fails transiently a fixed number of times before
    /// delegating to a real in-memory registry, for exercising the retry
    /// wrapper `open_or_create` applies.
    struct FlakyRegistry {
        fail_remaining: AtomicU32,
        inner: MemRegistry,
    }

    impl FlakyRegistry {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_remaining: AtomicU32::new(fail_times),
                inner: MemRegistry::new(),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(SopError::BackendTransient("flaky registry".into()));
            }
            Ok(())
        }
    }

    impl Registry for FlakyRegistry {
        fn get(&self, table: &str, id: LogicalId) -> Result<Option<Handle>> {
            self.maybe_fail()?;
            self.inner.get(table, id)
        }

        fn get_many(&self, table: &str, ids: &[LogicalId]) -> Result<Vec<Option<Handle>>> {
            self.maybe_fail()?;
            self.inner.get_many(table, ids)
        }

        fn put(&self, table: &str, handle: Handle) -> Result<()> {
            self.maybe_fail()?;
            self.inner.put(table, handle)
        }

        fn put_many(&self, table: &str, handles: &[Handle]) -> Result<()> {
            self.maybe_fail()?;
            self.inner.put_many(table, handles)
        }

        fn delete(&self, table: &str, id: LogicalId) -> Result<()> {
            self.maybe_fail()?;
            self.inner.delete(table, id)
        }
    }

    fn backends() -> Backends {
        Backends {
            registry: Arc::new(MemRegistry::new()),
            blob_store: Arc::new(MemBlobStore::new()),
            l1_cache: Arc::new(sop_storage::MruCache::new(64)),
            l2_cache: Arc::new(MemL2Cache::new()),
            store_repo: Arc::new(MemStoreRepository::new()),
            log: Arc::new(MemTransactionLog::new()),
            gc: Arc::new(sop_storage::FifoDeferredGc::new()),
        }
    }

    #[test]
    fn open_or_create_creates_on_first_open() {
        let mgr = TransactionManager::open_or_create("orders", StoreOptions::default(), backends());
        assert!(mgr.is_ok());
        assert_eq!(mgr.unwrap().store_info().count, 0);
    }

    #[test]
    fn reopen_with_matching_options_succeeds() {
        let b = backends();
        TransactionManager::open_or_create("orders", StoreOptions::default(), b.clone()).unwrap();
        let reopened = TransactionManager::open_or_create("orders", StoreOptions::default(), b);
        assert!(reopened.is_ok());
    }

    #[test]
    fn reopen_with_mismatched_options_fails() {
        let b = backends();
        TransactionManager::open_or_create("orders", StoreOptions::default(), b.clone()).unwrap();
        let mut other = StoreOptions::default();
        other.is_unique = false;
        let reopened = TransactionManager::open_or_create("orders", other, b);
        assert!(matches!(reopened, Err(SopError::ConfigMismatch(_))));
    }

    #[test]
    fn wrap_with_retry_retries_transient_registry_failures_and_records_them() {
        let mut b = backends();
        b.registry = Arc::new(FlakyRegistry::new(2));
        let metrics = Arc::new(TransactionMetrics::new());
        let wrapped = TransactionManager::wrap_with_retry(b, &metrics);
        wrapped.registry.get("t", LogicalId::new()).unwrap();
        assert_eq!(metrics.snapshot().retries, 2);
    }

    #[test]
    fn wrap_with_retry_surfaces_exhausted_transient_failures() {
        let mut b = backends();
        b.registry = Arc::new(FlakyRegistry::new(10));
        let metrics = Arc::new(TransactionMetrics::new());
        let wrapped = TransactionManager::wrap_with_retry(b, &metrics);
        let err = wrapped.registry.get("t", LogicalId::new()).unwrap_err();
        assert!(matches!(err, SopError::BackendTransient(_)));
    }

    #[test]
    fn begin_issues_a_transaction_in_the_requested_mode() {
        let mut mgr =
            TransactionManager::open_or_create("orders", StoreOptions::default(), backends())
                .unwrap();
        let tx = mgr.begin(TransactionMode::ForWriting).unwrap();
        assert_eq!(tx.mode(), TransactionMode::ForWriting);
        assert_eq!(mgr.metrics().begun, 1);
    }
}
