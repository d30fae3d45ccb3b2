//! One transaction against a [`crate::Store`]: the B-tree's ordered
//! key-value cursor operations, layered over `sop-concurrency`'s staging
//! and two-phase commit.

use sop_concurrency::{Transaction, TransactionMode};
use sop_core::error::Result;
use sop_core::ids::{ItemId, TransactionId};
use sop_engine::{Btree, Cursor, FindKind};

/// A transaction against one [`crate::Store`], combining the Transaction
/// Core's staging/commit with the B-tree algorithm's ordered operations.
///
/// Every mutating method keeps `tx`'s pending root in sync with wherever
/// the tree's root currently is, so a split or a root-collapsing merge is
/// transparent to the caller — [`StoreTransaction::commit`] always commits
/// whatever root the tree ended up with.
pub struct StoreTransaction {
    tx: Transaction,
    tree: Btree,
}

impl StoreTransaction {
    pub(crate) fn new(tx: Transaction, tree: Btree) -> Self {
        StoreTransaction { tx, tree }
    }

    fn sync_root(&mut self) {
        self.tx.set_root(self.tree.root());
    }

    /// This transaction's identity.
    pub fn id(&self) -> TransactionId {
        self.tx.id()
    }

    /// The mode this transaction began with.
    pub fn mode(&self) -> TransactionMode {
        self.tx.mode()
    }

    // ---- mutating cursor operations ----

    /// Insert `(key, value)`. Fails with [`sop_core::error::SopError::Conflict`]
    /// in a unique store if `key` already exists.
    pub fn add(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<ItemId> {
        let item_id = self.tree.add(&mut self.tx, key, value)?;
        self.sync_root();
        self.tx.bump_count(1);
        Ok(item_id)
    }

    /// Insert `(key, value)` only if `key` is absent; `Ok(None)` if it
    /// already existed.
    pub fn add_if_not_exist(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<ItemId>> {
        let item_id = self.tree.add_if_not_exist(&mut self.tx, key, value)?;
        self.sync_root();
        if item_id.is_some() {
            self.tx.bump_count(1);
        }
        Ok(item_id)
    }

    /// Update the value for an existing key. Fails if `key` is absent.
    pub fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.tree.update(&mut self.tx, key, value)?;
        self.sync_root();
        Ok(())
    }

    /// Insert `(key, value)`, replacing the existing value if `key` is
    /// already present.
    pub fn upsert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<ItemId> {
        let existed = self.tree.find(&mut self.tx, &key, FindKind::Any)?.is_some();
        let item_id = self.tree.upsert(&mut self.tx, key, value)?;
        self.sync_root();
        if !existed {
            self.tx.bump_count(1);
        }
        Ok(item_id)
    }

    /// Remove the first item matching `key`. Returns `false` if absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let removed = self.tree.remove(&mut self.tx, key)?;
        self.sync_root();
        if removed {
            self.tx.bump_count(-1);
        }
        Ok(removed)
    }

    /// Remove the item at `cursor`'s position, re-seating on whatever
    /// follows it.
    pub fn remove_current_item(&mut self, cursor: &Cursor) -> Result<Option<Cursor>> {
        let next = self.tree.remove_current_item(&mut self.tx, cursor)?;
        self.sync_root();
        self.tx.bump_count(-1);
        Ok(next)
    }

    /// Overwrite the value at `cursor`'s position.
    pub fn update_current_value(&mut self, cursor: &Cursor, value: Vec<u8>) -> Result<()> {
        self.tree.update_current_value(&mut self.tx, cursor, value)
    }

    /// Change the key at `cursor`'s position. Does not re-sort the tree —
    /// see [`Btree::update_current_key`]'s caveat.
    pub fn update_current_key(&mut self, cursor: &Cursor, key: Vec<u8>) -> Result<()> {
        self.tree.update_current_key(&mut self.tx, cursor, key)
    }

    // ---- read-only cursor operations ----

    /// Seat a cursor on `key`, or `Ok(None)` if absent.
    pub fn find(&mut self, key: &[u8], kind: FindKind) -> Result<Option<Cursor>> {
        self.tree.find(&mut self.tx, key, kind)
    }

    /// Seat a cursor on the slot with the given `(key, item_id)` pair.
    pub fn find_with_id(&mut self, key: &[u8], item_id: ItemId) -> Result<Option<Cursor>> {
        self.tree.find_with_id(&mut self.tx, key, item_id)
    }

    /// Seat a cursor on the smallest key in the tree.
    pub fn first(&mut self) -> Result<Option<Cursor>> {
        self.tree.first(&mut self.tx)
    }

    /// Seat a cursor on the largest key in the tree.
    pub fn last(&mut self) -> Result<Option<Cursor>> {
        self.tree.last(&mut self.tx)
    }

    /// In-order successor of `cursor`.
    pub fn next(&mut self, cursor: &Cursor) -> Result<Option<Cursor>> {
        self.tree.next(&mut self.tx, cursor)
    }

    /// In-order predecessor of `cursor`.
    pub fn previous(&mut self, cursor: &Cursor) -> Result<Option<Cursor>> {
        self.tree.previous(&mut self.tx, cursor)
    }

    /// The key at `cursor`'s position.
    pub fn get_current_key(&mut self, cursor: &Cursor) -> Result<Vec<u8>> {
        self.tree.get_current_key(&mut self.tx, cursor)
    }

    /// The item id at `cursor`'s position.
    pub fn get_current_item_id(&mut self, cursor: &Cursor) -> Result<ItemId> {
        self.tree.get_current_item_id(&mut self.tx, cursor)
    }

    /// The value at `cursor`'s position.
    pub fn get_current_value(&mut self, cursor: &Cursor) -> Result<Vec<u8>> {
        self.tree.get_current_value(&mut self.tx, cursor)
    }

    /// Number of items in the tree, by full traversal.
    pub fn count(&mut self) -> Result<u64> {
        self.tree.count(&mut self.tx)
    }

    // ---- commit / rollback ----

    /// Phase 1 of two-phase commit (stage & verify).
    pub fn phase1_commit(&mut self) -> Result<()> {
        self.tx.phase1_commit()
    }

    /// Phase 2 of two-phase commit (the atomic flip).
    pub fn phase2_commit(&mut self) -> Result<()> {
        self.tx.phase2_commit()
    }

    /// Run phase 1 then phase 2.
    pub fn commit(&mut self) -> Result<()> {
        self.tx.commit()
    }

    /// Discard this transaction's staged work.
    pub fn rollback(&mut self) -> Result<()> {
        self.tx.rollback()
    }
}
