//! Opening, creating, and re-opening a named store.

use crate::transaction::StoreTransaction;
use sop_concurrency::{Backends, MetricsSnapshot, TransactionManager, TransactionMode};
use sop_core::comparator::{ByteLexComparator, KeyComparator};
use sop_core::error::{Result, SopError};
use sop_core::store_info::{StoreInfo, StoreOptions};
use sop_engine::{Btree, BtreeConfig};
use std::sync::Arc;

/// A named, durable B-tree: the handle an application holds for the
/// lifetime of its use of one store, and the factory for the
/// [`StoreTransaction`]s it issues.
pub struct Store {
    manager: TransactionManager,
    comparator: Arc<dyn KeyComparator>,
}

impl Store {
    /// Create a brand-new store named `name`. Fails with
    /// [`SopError::ConfigMismatch`] if a store by that name already exists —
    /// use [`Store::open_btree`] or [`Store::open_or_create`] for re-opens.
    pub fn new_btree(name: &str, options: StoreOptions, backends: Backends) -> Result<Self> {
        Self::new_btree_with_comparator(name, options, backends, Arc::new(ByteLexComparator))
    }

    /// [`Store::new_btree`] with a non-default key ordering.
    pub fn new_btree_with_comparator(
        name: &str,
        options: StoreOptions,
        backends: Backends,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self> {
        if backends.store_repo.get(name)?.is_some() {
            return Err(SopError::ConfigMismatch(format!(
                "store '{name}' already exists"
            )));
        }
        Self::open_or_create(name, options, backends, comparator)
    }

    /// Open a store that must already exist. Fails if `name` has never been
    /// created.
    pub fn open_btree(name: &str, backends: Backends) -> Result<Self> {
        Self::open_btree_with_comparator(name, backends, Arc::new(ByteLexComparator))
    }

    /// [`Store::open_btree`] with a non-default key ordering. The
    /// comparator must match whatever the store was originally created
    /// with — changing it mid-lifetime is undefined behavior, and it's the
    /// caller's responsibility to keep it consistent, since [`StoreInfo`]
    /// has no way to persist a `dyn KeyComparator`.
    pub fn open_btree_with_comparator(
        name: &str,
        backends: Backends,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self> {
        let existing = backends
            .store_repo
            .get(name)?
            .ok_or_else(|| SopError::Invariant(format!("store '{name}' does not exist")))?;
        Self::open_or_create(name, existing.options(), backends, comparator)
    }

    /// Open `name` if it exists, or create it with `options` if this is the
    /// first open — the flexible entry point [`TransactionManager::
    /// open_or_create`] itself exposes, wrapped so the tree's root leaf
    /// also gets created on a brand-new store.
    pub fn open_or_create(
        name: &str,
        options: StoreOptions,
        backends: Backends,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self> {
        let mut manager = TransactionManager::open_or_create(name, options, backends)?;
        Self::ensure_root_initialized(&mut manager, &comparator)?;
        Ok(Store { manager, comparator })
    }

    /// A brand-new store's `StoreInfo.root_node_logical_id` names a logical
    /// id with nothing registered under it yet (`TransactionManager` only
    /// reserves the id; it doesn't stage a node). The first `Store` to open
    /// that store notices the root is unbacked and stages an empty leaf for
    /// it; every subsequent open is a no-op check-and-rollback.
    fn ensure_root_initialized(
        manager: &mut TransactionManager,
        comparator: &Arc<dyn KeyComparator>,
    ) -> Result<()> {
        let mut tx = manager.begin(TransactionMode::ForWriting)?;
        if tx.get_node(manager.root())?.is_none() {
            let config = Self::btree_config(manager.store_info(), comparator.clone());
            let tree = Btree::create_empty(&mut tx, config)?;
            tx.set_root(tree.root());
            tx.commit()?;
        } else {
            tx.rollback()?;
        }
        Ok(())
    }

    fn btree_config(info: &StoreInfo, comparator: Arc<dyn KeyComparator>) -> BtreeConfig {
        BtreeConfig {
            slot_length: info.slot_length,
            is_unique: info.is_unique,
            is_value_data_in_node_segment: info.is_value_data_in_node_segment,
            leaf_load_balancing: info.leaf_load_balancing,
            comparator,
        }
    }

    /// Begin a transaction against this store.
    pub fn begin(&mut self, mode: TransactionMode) -> Result<StoreTransaction> {
        let tx = self.manager.begin(mode)?;
        let config = Self::btree_config(self.manager.store_info(), self.comparator.clone());
        let tree = Btree::open(tx.root(), config);
        Ok(StoreTransaction::new(tx, tree))
    }

    /// This store's metadata, as last observed (refreshed on every
    /// [`Store::begin`]).
    pub fn store_info(&self) -> &StoreInfo {
        self.manager.store_info()
    }

    /// Snapshot of every transaction this store has issued.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics()
    }
}
