//! The B-tree algorithm.
//!
//! A classical B-tree (CLRS-style: keys live in internal nodes too, not only
//! in leaves) of order driven by [`BtreeConfig::slot_length`]. Insertion
//! splits full nodes pre-emptively on the way down so a single top-down pass
//! suffices; deletion fixes up any child about to be visited so it holds more
//! than the minimum occupancy, either by donating from an adjacent sibling
//! (leaf load balancing) or by merging, before descending into it. Both
//! techniques avoid having to propagate a split or merge result back up a
//! second time.

use crate::cursor::{Cursor, PathStep};
use crate::node_repository::NodeRepository;
use sop_core::comparator::{ByteLexComparator, KeyComparator};
use sop_core::error::{Result, SopError};
use sop_core::ids::{ItemId, LogicalId, PhysicalId};
use sop_core::node::{Node, Slot, SlotValue};
use std::sync::Arc;

/// Selects whether [`Btree::find`] seats the cursor on the first matching
/// key (leftmost, for stable iteration over duplicates) or is content with
/// any matching slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKind {
    /// Seat on the leftmost slot whose key matches; in non-unique stores,
    /// ties among duplicate keys break by insertion order (stable).
    First,
    /// Seat on any slot whose key matches; faster when duplicates aren't of
    /// interest.
    Any,
}

/// The fixed-for-the-store's-lifetime shape parameters the algorithm needs.
///
/// Mirrors the subset of [`sop_core::store_info::StoreInfo`] the tree itself
/// consults; the rest (name, table names, count) is the API layer's concern.
#[derive(Debug, Clone)]
pub struct BtreeConfig {
    /// Fixed slot capacity per node. Must be at least 4.
    pub slot_length: u16,
    /// Whether keys must be distinct across the whole tree.
    pub is_unique: bool,
    /// Whether a slot's value lives inline or in a separate blob.
    pub is_value_data_in_node_segment: bool,
    /// Whether leaf underflow rebalances with a sibling before merging.
    pub leaf_load_balancing: bool,
    /// Key ordering. Defaults to byte-lexicographic.
    pub comparator: Arc<dyn KeyComparator>,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        BtreeConfig {
            slot_length: 8,
            is_unique: true,
            is_value_data_in_node_segment: true,
            leaf_load_balancing: false,
            comparator: Arc::new(ByteLexComparator),
        }
    }
}

/// The B-tree algorithm, parameterized over a [`NodeRepository`] view.
///
/// Holds the tree's current root logical id as plain in-memory state; a
/// split of the root (insert) or collapse of the root (delete merging its
/// last two children) updates [`Btree::root`] directly. The caller (the
/// Transaction Core's node-repository wrapper, ultimately the API layer) is
/// responsible for noticing `root()` changed and persisting it to
/// `StoreInfo.root_node_logical_id`, logging a `commitNewRootNodes` phase —
/// the algorithm itself has no notion of a Store.
pub struct Btree {
    root: LogicalId,
    config: BtreeConfig,
}

impl Btree {
    /// Wrap an existing tree's root logical id.
    pub fn open(root: LogicalId, config: BtreeConfig) -> Self {
        Btree { root, config }
    }

    /// Create a brand-new, empty tree: stages one empty leaf as the root.
    pub fn create_empty(repo: &mut dyn NodeRepository, config: BtreeConfig) -> Result<Self> {
        let leaf = Node::new_leaf(PhysicalId::new(), config.slot_length);
        let root = repo.add(leaf)?;
        Ok(Btree { root, config })
    }

    /// The tree's current root logical id.
    pub fn root(&self) -> LogicalId {
        self.root
    }

    fn min_keys(&self) -> usize {
        (self.config.slot_length as usize).div_ceil(2).saturating_sub(1)
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.config.comparator.compare(a, b)
    }

    // ---- Insertion -------------------------------------------------------

    /// Insert `(key, value)`. Fails with [`SopError::Conflict`] for a unique
    /// store if `key` already exists — a duplicate-key error is surfaced as
    /// a conflict so callers retry/inspect at the transaction boundary.
    pub fn add(&mut self, repo: &mut dyn NodeRepository, key: Vec<u8>, value: Vec<u8>) -> Result<ItemId> {
        if self.config.is_unique && self.find(repo, &key, FindKind::Any)?.is_some() {
            return Err(SopError::Conflict(format!(
                "key already exists in unique store"
            )));
        }
        self.insert_unchecked(repo, key, value)
    }

    /// Insert `(key, value)` only if `key` is absent; returns `Ok(None)` if
    /// it already existed (a no-op) rather than an error.
    pub fn add_if_not_exist(
        &mut self,
        repo: &mut dyn NodeRepository,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Option<ItemId>> {
        if self.find(repo, &key, FindKind::Any)?.is_some() {
            return Ok(None);
        }
        Ok(Some(self.insert_unchecked(repo, key, value)?))
    }

    /// Insert `(key, value)`, replacing the existing value if `key` is
    /// already present in a unique store (non-unique stores always add a
    /// new item, matching `Add`'s stable-right-insertion semantics).
    pub fn upsert(&mut self, repo: &mut dyn NodeRepository, key: Vec<u8>, value: Vec<u8>) -> Result<ItemId> {
        if self.config.is_unique {
            if let Some(cursor) = self.find(repo, &key, FindKind::Any)? {
                self.update_current_value(repo, &cursor, value)?;
                return self.get_current_item_id(repo, &cursor);
            }
        }
        self.insert_unchecked(repo, key, value)
    }

    /// Update the value for an existing key (unique stores) or the first
    /// matching key (non-unique stores). Fails if `key` is absent.
    pub fn update(&mut self, repo: &mut dyn NodeRepository, key: &[u8], value: Vec<u8>) -> Result<()> {
        let cursor = self
            .find(repo, key, FindKind::First)?
            .ok_or_else(|| SopError::Conflict("key not found for update".into()))?;
        self.update_current_value(repo, &cursor, value)
    }

    fn insert_unchecked(
        &mut self,
        repo: &mut dyn NodeRepository,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<ItemId> {
        let item_id = ItemId::new();
        let slot = self.make_slot(repo, item_id, key, value)?;

        let root_node = repo
            .get(self.root)?
            .ok_or_else(|| SopError::Invariant("root node missing from repository".into()))?;
        if root_node.slot_count() >= self.config.slot_length as usize {
            let new_root_id = self.split_root(repo, root_node)?;
            self.root = new_root_id;
        }
        self.insert_non_full(repo, self.root, slot)?;
        Ok(item_id)
    }

    fn make_slot(
        &self,
        repo: &mut dyn NodeRepository,
        item_id: ItemId,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Slot> {
        if self.config.is_value_data_in_node_segment {
            Ok(Slot::in_node(item_id, key, value))
        } else {
            let value_id = repo.add_value(value)?;
            Ok(Slot::separate(item_id, key, value_id))
        }
    }

    /// Split a full root: the old root's middle slot is promoted into a new,
    /// single-slot internal node with two children (the old root's left and
    /// right halves).
    fn split_root(&mut self, repo: &mut dyn NodeRepository, mut root_node: Node) -> Result<LogicalId> {
        let old_root_logical = self.root;
        let (median, right) = Self::split_node(&mut root_node, self.config.slot_length);
        repo.update(old_root_logical, root_node)?;
        let right_logical = repo.add(right)?;
        let new_root = Node::new_internal(
            PhysicalId::new(),
            self.config.slot_length,
            vec![old_root_logical, right_logical],
        );
        let mut new_root = new_root;
        new_root.slots.push(median);
        let new_root_logical = repo.add(new_root)?;
        Ok(new_root_logical)
    }

    /// Split a full node in half: the left half stays in `node` (mutated in
    /// place), the right half and the promoted median slot are returned.
    fn split_node(node: &mut Node, slot_length: u16) -> (Slot, Node) {
        let was_leaf = node.is_leaf();
        let mid = node.slots.len() / 2;
        let median = node.slots.remove(mid);
        let right_slots = node.slots.split_off(mid);
        let mut right = if was_leaf {
            Node::new_leaf(PhysicalId::new(), slot_length)
        } else {
            let right_children = node.children.split_off(mid + 1);
            Node::new_internal(PhysicalId::new(), slot_length, right_children)
        };
        right.slots = right_slots;
        (median, right)
    }

    /// Insert `slot` into the subtree rooted at `node_id`, which the caller
    /// guarantees is not full (pre-emptive splitting keeps this invariant
    /// true at every level below the root).
    fn insert_non_full(&mut self, repo: &mut dyn NodeRepository, node_id: LogicalId, slot: Slot) -> Result<()> {
        let mut node = repo
            .get(node_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;

        if node.is_leaf() {
            let pos = self.insertion_position(&node, &slot.key, true);
            node.slots.insert(pos, slot);
            repo.update(node_id, node)?;
            return Ok(());
        }

        let mut child_idx = self.insertion_position(&node, &slot.key, false);
        let child_id = node.children[child_idx];
        let child = repo
            .get(child_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {child_id} missing from repository")))?;

        if child.slot_count() >= self.config.slot_length as usize {
            self.split_child(repo, &mut node, node_id, child_idx, child)?;
            if self.cmp(&slot.key, &node.slots[child_idx].key) == std::cmp::Ordering::Greater {
                child_idx += 1;
            }
        }

        self.insert_non_full(repo, node.children[child_idx], slot)
    }

    /// Split `node.children[child_idx]` (already fetched as `child`),
    /// promoting its median slot into `node` and inserting the new right
    /// sibling next to it.
    fn split_child(
        &mut self,
        repo: &mut dyn NodeRepository,
        node: &mut Node,
        node_id: LogicalId,
        child_idx: usize,
        mut child: Node,
    ) -> Result<()> {
        let child_id = node.children[child_idx];
        let (median, right) = Self::split_node(&mut child, self.config.slot_length);
        repo.update(child_id, child)?;
        let right_id = repo.add(right)?;
        node.slots.insert(child_idx, median);
        node.children.insert(child_idx + 1, right_id);
        repo.update(node_id, node.clone())?;
        Ok(())
    }

    /// Position at which `key` belongs among `node.slots`. For a leaf
    /// insertion in a non-unique store, ties insert to the right (stable
    /// insertion order). For descent in an internal node, ties route to the
    /// left child unless an exact-match slot means the key is the internal
    /// node's own (searched for separately by callers that care).
    fn insertion_position(&self, node: &Node, key: &[u8], for_leaf_insert: bool) -> usize {
        let mut lo = 0usize;
        let mut hi = node.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ord = self.cmp(key, &node.slots[mid].key);
            let go_left = if for_leaf_insert {
                ord == std::cmp::Ordering::Less
            } else {
                ord != std::cmp::Ordering::Greater
            };
            if go_left {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    // ---- Search ------------------------------------------------------

    /// Seat a cursor on `key`, or `Ok(None)` if absent.
    pub fn find(&self, repo: &mut dyn NodeRepository, key: &[u8], kind: FindKind) -> Result<Option<Cursor>> {
        let mut path = Vec::new();
        let mut node_id = self.root;
        loop {
            let node = repo
                .get(node_id)?
                .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
            let pos = self.insertion_position(&node, key, false);
            if pos < node.slots.len() && self.cmp(key, &node.slots[pos].key) == std::cmp::Ordering::Equal {
                path.push(PathStep { node: node_id, index: pos });
                let cursor = Cursor { path };
                return if kind == FindKind::First {
                    Ok(Some(self.leftmost_equal(repo, cursor, key)?))
                } else {
                    Ok(Some(cursor))
                };
            }
            if node.is_leaf() {
                return Ok(None);
            }
            path.push(PathStep { node: node_id, index: pos });
            node_id = node.children[pos];
        }
    }

    /// Seat a cursor on the slot with the given `(key, item_id)` pair, for
    /// non-unique stores with several items sharing a key.
    pub fn find_with_id(
        &self,
        repo: &mut dyn NodeRepository,
        key: &[u8],
        item_id: ItemId,
    ) -> Result<Option<Cursor>> {
        let mut cursor = match self.find(repo, key, FindKind::First)? {
            Some(c) => c,
            None => return Ok(None),
        };
        loop {
            let current_item = self.get_current_item_id(repo, &cursor)?;
            if current_item == item_id {
                return Ok(Some(cursor));
            }
            let current_key = self.get_current_key(repo, &cursor)?;
            match self.next(repo, &cursor)? {
                Some(next) => {
                    let next_key = self.get_current_key(repo, &next)?;
                    if self.cmp(&next_key, &current_key) != std::cmp::Ordering::Equal {
                        return Ok(None);
                    }
                    cursor = next;
                }
                None => return Ok(None),
            }
        }
    }

    /// Walk backward from an exact-match cursor to the leftmost slot with an
    /// equal key, so non-unique lookups are stable (insertion order).
    fn leftmost_equal(&self, repo: &mut dyn NodeRepository, cursor: Cursor, key: &[u8]) -> Result<Cursor> {
        let mut current = cursor;
        loop {
            match self.previous(repo, &current)? {
                Some(prev) => {
                    let prev_key = self.get_current_key(repo, &prev)?;
                    if self.cmp(&prev_key, key) != std::cmp::Ordering::Equal {
                        return Ok(current);
                    }
                    current = prev;
                }
                None => return Ok(current),
            }
        }
    }

    /// Seat a cursor on the smallest key in the tree, or `Ok(None)` if empty.
    pub fn first(&self, repo: &mut dyn NodeRepository) -> Result<Option<Cursor>> {
        let mut path = Vec::new();
        let mut node_id = self.root;
        loop {
            let node = repo
                .get(node_id)?
                .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
            if node.is_leaf() {
                if node.slots.is_empty() {
                    return Ok(None);
                }
                path.push(PathStep { node: node_id, index: 0 });
                return Ok(Some(Cursor { path }));
            }
            path.push(PathStep { node: node_id, index: 0 });
            node_id = node.children[0];
        }
    }

    /// Seat a cursor on the largest key in the tree, or `Ok(None)` if empty.
    pub fn last(&self, repo: &mut dyn NodeRepository) -> Result<Option<Cursor>> {
        let mut path = Vec::new();
        let mut node_id = self.root;
        loop {
            let node = repo
                .get(node_id)?
                .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
            if node.is_leaf() {
                if node.slots.is_empty() {
                    return Ok(None);
                }
                let idx = node.slots.len() - 1;
                path.push(PathStep { node: node_id, index: idx });
                return Ok(Some(Cursor { path }));
            }
            let idx = node.children.len() - 1;
            path.push(PathStep { node: node_id, index: idx });
            node_id = node.children[idx];
        }
    }

    /// In-order successor of `cursor`, or `Ok(None)` at the end of the tree.
    pub fn next(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<Option<Cursor>> {
        let mut path = cursor.path.clone();
        let last = *path.last().expect("cursor path is never empty when valid");
        let node = repo
            .get(last.node)?
            .ok_or_else(|| SopError::Invariant(format!("node {} missing from repository", last.node)))?;

        if !node.is_leaf() {
            // Descend into the child right after this slot, then go as far
            // left as possible.
            let child_idx = last.index + 1;
            *path.last_mut().unwrap() = PathStep { node: last.node, index: child_idx };
            let mut node_id = node.children[child_idx];
            loop {
                let n = repo
                    .get(node_id)?
                    .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
                if n.is_leaf() {
                    if n.slots.is_empty() {
                        return Ok(None);
                    }
                    path.push(PathStep { node: node_id, index: 0 });
                    return Ok(Some(Cursor { path }));
                }
                path.push(PathStep { node: node_id, index: 0 });
                node_id = n.children[0];
            }
        }

        // Leaf: either the next slot in this same node, or pop up to the
        // parent whose own slot comes right after the child subtree we just
        // finished.
        if last.index + 1 < node.slots.len() {
            *path.last_mut().unwrap() = PathStep { node: last.node, index: last.index + 1 };
            return Ok(Some(Cursor { path }));
        }
        path.pop();
        while let Some(parent) = path.last().copied() {
            if parent.index < self.slot_count_of(repo, parent.node)? {
                *path.last_mut().unwrap() = PathStep { node: parent.node, index: parent.index };
                return Ok(Some(Cursor { path }));
            }
            path.pop();
        }
        Ok(None)
    }

    /// In-order predecessor of `cursor`, or `Ok(None)` at the start of the
    /// tree.
    pub fn previous(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<Option<Cursor>> {
        let mut path = cursor.path.clone();
        let last = *path.last().expect("cursor path is never empty when valid");
        let node = repo
            .get(last.node)?
            .ok_or_else(|| SopError::Invariant(format!("node {} missing from repository", last.node)))?;

        if !node.is_leaf() {
            let child_idx = last.index;
            let mut node_id = node.children[child_idx];
            loop {
                let n = repo
                    .get(node_id)?
                    .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
                if n.is_leaf() {
                    if n.slots.is_empty() {
                        return Ok(None);
                    }
                    let idx = n.slots.len() - 1;
                    path.push(PathStep { node: node_id, index: idx });
                    return Ok(Some(Cursor { path }));
                }
                let idx = n.children.len() - 1;
                path.push(PathStep { node: node_id, index: idx });
                node_id = n.children[idx];
            }
        }

        if last.index > 0 {
            *path.last_mut().unwrap() = PathStep { node: last.node, index: last.index - 1 };
            return Ok(Some(Cursor { path }));
        }
        path.pop();
        while let Some(parent) = path.last().copied() {
            if parent.index > 0 {
                *path.last_mut().unwrap() = PathStep { node: parent.node, index: parent.index - 1 };
                return Ok(Some(Cursor { path }));
            }
            path.pop();
        }
        Ok(None)
    }

    fn slot_count_of(&self, repo: &mut dyn NodeRepository, node_id: LogicalId) -> Result<usize> {
        Ok(repo
            .get(node_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?
            .slot_count())
    }

    // ---- Cursor-relative item access --------------------------------

    /// The key at `cursor`'s position.
    pub fn get_current_key(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<Vec<u8>> {
        Ok(self.current_slot(repo, cursor)?.key)
    }

    /// The item id at `cursor`'s position.
    pub fn get_current_item_id(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<ItemId> {
        Ok(self.current_slot(repo, cursor)?.item_id)
    }

    /// The value at `cursor`'s position, dereferencing a separate blob if
    /// the store places values outside the node.
    pub fn get_current_value(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<Vec<u8>> {
        let slot = self.current_slot(repo, cursor)?;
        match slot.value {
            SlotValue::InNode(bytes) => Ok(bytes),
            SlotValue::Separate { value_id, .. } => repo
                .get_value(value_id)?
                .ok_or_else(|| SopError::Invariant(format!("missing value blob {value_id}"))),
        }
    }

    fn current_slot(&self, repo: &mut dyn NodeRepository, cursor: &Cursor) -> Result<Slot> {
        let step = cursor
            .path
            .last()
            .ok_or_else(|| SopError::Invariant("cursor has no current item".into()))?;
        let node = repo
            .get(step.node)?
            .ok_or_else(|| SopError::Invariant(format!("node {} missing from repository", step.node)))?;
        node.slots
            .get(step.index)
            .cloned()
            .ok_or_else(|| SopError::Invariant("cursor index out of range".into()))
    }

    /// Overwrite the value at `cursor`'s position in place (same key, same
    /// item id).
    pub fn update_current_value(
        &mut self,
        repo: &mut dyn NodeRepository,
        cursor: &Cursor,
        value: Vec<u8>,
    ) -> Result<()> {
        let step = *cursor
            .path
            .last()
            .ok_or_else(|| SopError::Invariant("cursor has no current item".into()))?;
        let mut node = repo
            .get(step.node)?
            .ok_or_else(|| SopError::Invariant(format!("node {} missing from repository", step.node)))?;
        let slot = node
            .slots
            .get_mut(step.index)
            .ok_or_else(|| SopError::Invariant("cursor index out of range".into()))?;
        match &slot.value {
            SlotValue::InNode(_) => slot.value = SlotValue::InNode(value),
            SlotValue::Separate { value_id, value_version } => {
                let new_id = repo.update_value(*value_id, value)?;
                slot.value = SlotValue::Separate {
                    value_id: new_id,
                    value_version: value_version.wrapping_add(1),
                };
            }
        }
        repo.update(step.node, node)
    }

    /// Change the key at `cursor`'s position. Does not re-sort the tree —
    /// callers must ensure the new key preserves ordering relative to
    /// neighboring slots, or remove-then-add instead.
    pub fn update_current_key(
        &mut self,
        repo: &mut dyn NodeRepository,
        cursor: &Cursor,
        key: Vec<u8>,
    ) -> Result<()> {
        let step = *cursor
            .path
            .last()
            .ok_or_else(|| SopError::Invariant("cursor has no current item".into()))?;
        let mut node = repo
            .get(step.node)?
            .ok_or_else(|| SopError::Invariant(format!("node {} missing from repository", step.node)))?;
        let slot = node
            .slots
            .get_mut(step.index)
            .ok_or_else(|| SopError::Invariant("cursor index out of range".into()))?;
        slot.key = key;
        repo.update(step.node, node)
    }

    // ---- Deletion ----------------------------------------------------

    /// Remove the first item matching `key`. Returns `false` if `key` was
    /// absent.
    pub fn remove(&mut self, repo: &mut dyn NodeRepository, key: &[u8]) -> Result<bool> {
        if self.find(repo, key, FindKind::Any)?.is_none() {
            return Ok(false);
        }
        self.delete_recursive(repo, self.root, key, None)?;
        self.collapse_root_if_empty(repo)?;
        Ok(true)
    }

    /// Remove the item at `cursor`'s position, then reseat the cursor
    /// deterministically on the item that would have followed it — a
    /// cursor-invalidating mutation must either re-seat deterministically
    /// or be explicitly reset.
    pub fn remove_current_item(
        &mut self,
        repo: &mut dyn NodeRepository,
        cursor: &Cursor,
    ) -> Result<Option<Cursor>> {
        let key = self.get_current_key(repo, cursor)?;
        let item_id = self.get_current_item_id(repo, cursor)?;
        self.delete_recursive(repo, self.root, &key, Some(item_id))?;
        self.collapse_root_if_empty(repo)?;
        match self.find(repo, &key, FindKind::First)? {
            Some(c) => Ok(Some(c)),
            None => self.first(repo),
        }
    }

    fn collapse_root_if_empty(&mut self, repo: &mut dyn NodeRepository) -> Result<()> {
        let root_node = repo
            .get(self.root)?
            .ok_or_else(|| SopError::Invariant("root node missing from repository".into()))?;
        if !root_node.is_leaf() && root_node.slots.is_empty() {
            let only_child = root_node.children[0];
            let old_root = self.root;
            self.root = only_child;
            repo.remove(old_root)?;
        }
        Ok(())
    }

    /// Delete `key` (optionally a specific `item_id` among duplicates) from
    /// the subtree rooted at `node_id`. Ensures any child about to be
    /// visited holds more than [`Btree::min_keys`] before descending, so
    /// the deletion never needs a second upward pass.
    fn delete_recursive(
        &mut self,
        repo: &mut dyn NodeRepository,
        node_id: LogicalId,
        key: &[u8],
        item_id: Option<ItemId>,
    ) -> Result<()> {
        let mut node = repo
            .get(node_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;

        let found_idx = self.find_exact_slot(&node, key, item_id);

        if node.is_leaf() {
            if let Some(idx) = found_idx {
                let slot = node.slots.remove(idx);
                self.release_value(repo, &slot)?;
                repo.update(node_id, node)?;
            }
            return Ok(());
        }

        if let Some(idx) = found_idx {
            self.delete_from_internal(repo, node_id, node, idx, key, item_id)
        } else {
            let child_idx = self.insertion_position(&node, key, false);
            let fixed_child_idx = self.ensure_child_has_spare_key(repo, &mut node, node_id, child_idx)?;
            repo.update(node_id, node.clone())?;
            let child_id = node.children[fixed_child_idx];
            self.delete_recursive(repo, child_id, key, item_id)
        }
    }

    fn find_exact_slot(&self, node: &Node, key: &[u8], item_id: Option<ItemId>) -> Option<usize> {
        node.slots.iter().position(|s| {
            self.cmp(&s.key, key) == std::cmp::Ordering::Equal
                && item_id.map(|id| id == s.item_id).unwrap_or(true)
        })
    }

    fn release_value(&self, repo: &mut dyn NodeRepository, slot: &Slot) -> Result<()> {
        if let SlotValue::Separate { value_id, .. } = slot.value {
            repo.remove_value(value_id)?;
        }
        Ok(())
    }

    /// The key to delete is this node's own slot `idx` (an internal node).
    /// Classical B-tree procedure: replace it with its in-order predecessor
    /// or successor (whichever sibling subtree can spare one without
    /// underflowing), then recursively delete that key from the donor
    /// subtree. If neither can spare one, merge the two children and the
    /// separating slot (the item being deleted) into one node, then recurse
    /// the same delete into that merged node — the item now lives there as
    /// an ordinary slot, found the same way any other would be.
    fn delete_from_internal(
        &mut self,
        repo: &mut dyn NodeRepository,
        node_id: LogicalId,
        mut node: Node,
        idx: usize,
        key: &[u8],
        item_id: Option<ItemId>,
    ) -> Result<()> {
        let left_child_id = node.children[idx];
        let left_child = repo
            .get(left_child_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {left_child_id} missing from repository")))?;

        if left_child.slots.len() > self.min_keys() {
            let pred_slot = self.extract_max(repo, left_child_id)?;
            node.slots[idx] = pred_slot;
            repo.update(node_id, node)?;
            return Ok(());
        }

        let right_child_id = node.children[idx + 1];
        let right_child = repo
            .get(right_child_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {right_child_id} missing from repository")))?;
        if right_child.slots.len() > self.min_keys() {
            let succ_slot = self.extract_min(repo, right_child_id)?;
            node.slots[idx] = succ_slot;
            repo.update(node_id, node)?;
            return Ok(());
        }

        // Both children are at minimum occupancy: merge them (and the
        // separating slot) into one node, then delete the key from there.
        let removed_slot = node.slots.remove(idx);
        node.children.remove(idx + 1);
        let merged_id = self.merge_nodes(repo, left_child_id, removed_slot, right_child_id)?;
        node.children[idx] = merged_id;
        repo.update(node_id, node)?;
        self.delete_recursive(repo, merged_id, key, item_id)
    }

    /// Remove and return the largest slot in the subtree rooted at
    /// `node_id` (the in-order predecessor of whatever internal slot called
    /// this). Fixes up the rightmost child at every level before descending
    /// into it, exactly like [`Btree::delete_recursive`]'s non-match branch,
    /// so the removal never underflows a node on the way down.
    fn extract_max(&mut self, repo: &mut dyn NodeRepository, node_id: LogicalId) -> Result<Slot> {
        let mut node = repo
            .get(node_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
        if node.is_leaf() {
            let slot = node.slots.pop().expect("extract_max called on non-empty subtree");
            repo.update(node_id, node)?;
            return Ok(slot);
        }
        let last_idx = node.children.len() - 1;
        let fixed_idx = self.ensure_child_has_spare_key(repo, &mut node, node_id, last_idx)?;
        repo.update(node_id, node.clone())?;
        let child_id = node.children[fixed_idx];
        self.extract_max(repo, child_id)
    }

    /// Remove and return the smallest slot in the subtree rooted at
    /// `node_id` (the in-order successor). Symmetric to [`Btree::extract_max`].
    fn extract_min(&mut self, repo: &mut dyn NodeRepository, node_id: LogicalId) -> Result<Slot> {
        let mut node = repo
            .get(node_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {node_id} missing from repository")))?;
        if node.is_leaf() {
            let slot = node.slots.remove(0);
            repo.update(node_id, node)?;
            return Ok(slot);
        }
        let fixed_idx = self.ensure_child_has_spare_key(repo, &mut node, node_id, 0)?;
        repo.update(node_id, node.clone())?;
        let child_id = node.children[fixed_idx];
        self.extract_min(repo, child_id)
    }

    /// Ensure `node.children[child_idx]` has more than [`Btree::min_keys`]
    /// before the caller descends into it: borrow from a sibling (if
    /// `leaf_load_balancing` is enabled) or merge with one.
    fn ensure_child_has_spare_key(
        &mut self,
        repo: &mut dyn NodeRepository,
        node: &mut Node,
        node_id: LogicalId,
        child_idx: usize,
    ) -> Result<usize> {
        let child_id = node.children[child_idx];
        let child = repo
            .get(child_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {child_id} missing from repository")))?;
        if child.slots.len() > self.min_keys() {
            return Ok(child_idx);
        }

        if self.config.leaf_load_balancing {
            if child_idx > 0 {
                let left_sib_id = node.children[child_idx - 1];
                let left_sib = repo
                    .get(left_sib_id)?
                    .ok_or_else(|| SopError::Invariant(format!("node {left_sib_id} missing from repository")))?;
                if left_sib.slots.len() > self.min_keys() {
                    self.borrow_from_left(repo, node, node_id, child_idx, left_sib, child)?;
                    return Ok(child_idx);
                }
            }
            if child_idx + 1 < node.children.len() {
                let right_sib_id = node.children[child_idx + 1];
                let right_sib = repo
                    .get(right_sib_id)?
                    .ok_or_else(|| SopError::Invariant(format!("node {right_sib_id} missing from repository")))?;
                if right_sib.slots.len() > self.min_keys() {
                    self.borrow_from_right(repo, node, node_id, child_idx, child, right_sib)?;
                    return Ok(child_idx);
                }
            }
        }

        // No sibling can spare one (or load balancing is disabled): merge.
        if child_idx > 0 {
            let left_sib_id = node.children[child_idx - 1];
            let sep = node.slots.remove(child_idx - 1);
            node.children.remove(child_idx - 1);
            let left_sib = repo
                .get(left_sib_id)?
                .ok_or_else(|| SopError::Invariant(format!("node {left_sib_id} missing from repository")))?;
            let merged_id = self.merge_two(repo, left_sib_id, left_sib, sep, child_id, child)?;
            node.children[child_idx - 1] = merged_id;
            Ok(child_idx - 1)
        } else {
            let right_sib_id = node.children[child_idx + 1];
            let sep = node.slots.remove(child_idx);
            node.children.remove(child_idx + 1);
            let right_sib = repo
                .get(right_sib_id)?
                .ok_or_else(|| SopError::Invariant(format!("node {right_sib_id} missing from repository")))?;
            let merged_id = self.merge_two(repo, child_id, child, sep, right_sib_id, right_sib)?;
            node.children[child_idx] = merged_id;
            Ok(child_idx)
        }
    }

    fn borrow_from_left(
        &mut self,
        repo: &mut dyn NodeRepository,
        parent: &mut Node,
        parent_id: LogicalId,
        child_idx: usize,
        mut left_sib: Node,
        mut child: Node,
    ) -> Result<()> {
        let left_sib_id = parent.children[child_idx - 1];
        let child_id = parent.children[child_idx];
        let sep = parent.slots[child_idx - 1].clone();
        let donated = left_sib.slots.pop().unwrap();
        child.slots.insert(0, sep);
        parent.slots[child_idx - 1] = donated;
        if !left_sib.is_leaf() {
            let donated_child = left_sib.children.pop().unwrap();
            child.children.insert(0, donated_child);
        }
        repo.update(left_sib_id, left_sib)?;
        repo.update(child_id, child)?;
        repo.update(parent_id, parent.clone())?;
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        repo: &mut dyn NodeRepository,
        parent: &mut Node,
        parent_id: LogicalId,
        child_idx: usize,
        mut child: Node,
        mut right_sib: Node,
    ) -> Result<()> {
        let child_id = parent.children[child_idx];
        let right_sib_id = parent.children[child_idx + 1];
        let sep = parent.slots[child_idx].clone();
        let donated = right_sib.slots.remove(0);
        child.slots.push(sep);
        parent.slots[child_idx] = donated;
        if !right_sib.is_leaf() {
            let donated_child = right_sib.children.remove(0);
            child.children.push(donated_child);
        }
        repo.update(child_id, child)?;
        repo.update(right_sib_id, right_sib)?;
        repo.update(parent_id, parent.clone())?;
        Ok(())
    }

    /// Merge `left` (slots only; separator/right appended after) — used by
    /// [`Btree::delete_from_internal`]'s merge branch, which has already
    /// removed the separator and right child from the parent.
    fn merge_nodes(
        &mut self,
        repo: &mut dyn NodeRepository,
        left_id: LogicalId,
        separator: Slot,
        right_id: LogicalId,
    ) -> Result<LogicalId> {
        let left = repo
            .get(left_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {left_id} missing from repository")))?;
        let right = repo
            .get(right_id)?
            .ok_or_else(|| SopError::Invariant(format!("node {right_id} missing from repository")))?;
        self.merge_two(repo, left_id, left, separator, right_id, right)
    }

    fn merge_two(
        &mut self,
        repo: &mut dyn NodeRepository,
        left_id: LogicalId,
        mut left: Node,
        separator: Slot,
        right_id: LogicalId,
        right: Node,
    ) -> Result<LogicalId> {
        left.slots.push(separator);
        left.slots.extend(right.slots);
        left.children.extend(right.children);
        repo.update(left_id, left)?;
        repo.remove(right_id)?;
        Ok(left_id)
    }

    /// Number of items in the tree, computed by a full traversal. `StoreInfo`
    /// tracks a running, eventually-consistent count across commits instead;
    /// this is the exact count as of the caller's current view, useful for
    /// tests and for reconciling the two.
    pub fn count(&self, repo: &mut dyn NodeRepository) -> Result<u64> {
        let mut total = 0u64;
        let mut cursor = self.first(repo)?;
        while let Some(c) = cursor {
            total += 1;
            cursor = self.next(repo, &c)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A plain in-memory [`NodeRepository`] for exercising the algorithm in
    /// isolation, with no transaction or backend involved.
    #[derive(Default)]
    struct FakeRepo {
        nodes: HashMap<LogicalId, Node>,
        values: HashMap<PhysicalId, Vec<u8>>,
    }

    impl NodeRepository for FakeRepo {
        fn get(&mut self, logical_id: LogicalId) -> Result<Option<Node>> {
            Ok(self.nodes.get(&logical_id).cloned())
        }
        fn add(&mut self, node: Node) -> Result<LogicalId> {
            let id = LogicalId::new();
            self.nodes.insert(id, node);
            Ok(id)
        }
        fn update(&mut self, logical_id: LogicalId, node: Node) -> Result<()> {
            self.nodes.insert(logical_id, node);
            Ok(())
        }
        fn remove(&mut self, logical_id: LogicalId) -> Result<()> {
            self.nodes.remove(&logical_id);
            Ok(())
        }
        fn get_value(&mut self, value_id: PhysicalId) -> Result<Option<Vec<u8>>> {
            Ok(self.values.get(&value_id).cloned())
        }
        fn add_value(&mut self, bytes: Vec<u8>) -> Result<PhysicalId> {
            let id = PhysicalId::new();
            self.values.insert(id, bytes);
            Ok(id)
        }
        fn update_value(&mut self, old_value_id: PhysicalId, bytes: Vec<u8>) -> Result<PhysicalId> {
            self.values.remove(&old_value_id);
            let id = PhysicalId::new();
            self.values.insert(id, bytes);
            Ok(id)
        }
        fn remove_value(&mut self, value_id: PhysicalId) -> Result<()> {
            self.values.remove(&value_id);
            Ok(())
        }
    }

    fn small_config() -> BtreeConfig {
        BtreeConfig {
            slot_length: 4,
            ..BtreeConfig::default()
        }
    }

    fn key(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.add(&mut repo, key(1), b"one".to_vec()).unwrap();
        tree.add(&mut repo, key(2), b"two".to_vec()).unwrap();

        let cursor = tree.find(&mut repo, &key(1), FindKind::Any).unwrap().unwrap();
        assert_eq!(tree.get_current_value(&mut repo, &cursor).unwrap(), b"one");
        assert!(tree.find(&mut repo, &key(3), FindKind::Any).unwrap().is_none());
    }

    #[test]
    fn add_rejects_duplicate_key_in_unique_store() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.add(&mut repo, key(1), b"one".to_vec()).unwrap();
        let err = tree.add(&mut repo, key(1), b"again".to_vec()).unwrap_err();
        assert!(matches!(err, SopError::Conflict(_)));
    }

    #[test]
    fn insertion_causes_splits_and_stays_findable() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, small_config()).unwrap();
        for n in 0..50u32 {
            tree.add(&mut repo, key(n), n.to_le_bytes().to_vec()).unwrap();
        }
        for n in 0..50u32 {
            let cursor = tree.find(&mut repo, &key(n), FindKind::Any).unwrap();
            assert!(cursor.is_some(), "missing key {n}");
            assert_eq!(
                tree.get_current_value(&mut repo, &cursor.unwrap()).unwrap(),
                n.to_le_bytes().to_vec()
            );
        }
        assert_eq!(tree.count(&mut repo).unwrap(), 50);
    }

    #[test]
    fn first_last_and_in_order_traversal_match_sorted_order() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, small_config()).unwrap();
        let mut order: Vec<u32> = (0..30).collect();
        // Insert out of order to make sure the tree, not insertion order,
        // determines traversal order.
        order.reverse();
        for n in &order {
            tree.add(&mut repo, key(*n), vec![]).unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = tree.first(&mut repo).unwrap();
        while let Some(c) = cursor {
            seen.push(tree.get_current_key(&mut repo, &c).unwrap());
            cursor = tree.next(&mut repo, &c).unwrap();
        }
        let expected: Vec<Vec<u8>> = (0..30u32).map(key).collect();
        assert_eq!(seen, expected);

        let last = tree.last(&mut repo).unwrap().unwrap();
        assert_eq!(tree.get_current_key(&mut repo, &last).unwrap(), key(29));

        // Walking backward from the last item must reproduce the reverse
        // order.
        let mut backward = Vec::new();
        let mut cursor = Some(last);
        while let Some(c) = cursor {
            backward.push(tree.get_current_key(&mut repo, &c).unwrap());
            cursor = tree.previous(&mut repo, &c).unwrap();
        }
        let mut expected_rev = expected.clone();
        expected_rev.reverse();
        assert_eq!(backward, expected_rev);
    }

    #[test]
    fn non_unique_store_keeps_stable_insertion_order_for_duplicates() {
        let mut repo = FakeRepo::default();
        let config = BtreeConfig {
            is_unique: false,
            ..small_config()
        };
        let mut tree = Btree::create_empty(&mut repo, config).unwrap();
        let ids: Vec<ItemId> = (0..5)
            .map(|n| tree.add(&mut repo, key(7), vec![n as u8]).unwrap())
            .collect();

        let mut cursor = tree.find(&mut repo, &key(7), FindKind::First).unwrap().unwrap();
        let mut seen_ids = Vec::new();
        loop {
            seen_ids.push(tree.get_current_item_id(&mut repo, &cursor).unwrap());
            let next_key;
            match tree.next(&mut repo, &cursor).unwrap() {
                Some(n) => {
                    next_key = tree.get_current_key(&mut repo, &n).unwrap();
                    if next_key != key(7) {
                        break;
                    }
                    cursor = n;
                }
                None => break,
            }
        }
        assert_eq!(seen_ids, ids);
    }

    #[test]
    fn update_changes_the_value_without_moving_the_key() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.add(&mut repo, key(1), b"old".to_vec()).unwrap();
        tree.update(&mut repo, &key(1), b"new".to_vec()).unwrap();
        let cursor = tree.find(&mut repo, &key(1), FindKind::Any).unwrap().unwrap();
        assert_eq!(tree.get_current_value(&mut repo, &cursor).unwrap(), b"new");
    }

    #[test]
    fn upsert_inserts_when_absent_and_updates_when_present() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.upsert(&mut repo, key(1), b"first".to_vec()).unwrap();
        tree.upsert(&mut repo, key(1), b"second".to_vec()).unwrap();
        assert_eq!(tree.count(&mut repo).unwrap(), 1);
        let cursor = tree.find(&mut repo, &key(1), FindKind::Any).unwrap().unwrap();
        assert_eq!(tree.get_current_value(&mut repo, &cursor).unwrap(), b"second");
    }

    #[test]
    fn remove_deletes_the_key_and_shrinks_the_tree_with_merges() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, small_config()).unwrap();
        for n in 0..40u32 {
            tree.add(&mut repo, key(n), vec![]).unwrap();
        }
        for n in 0..40u32 {
            assert!(tree.remove(&mut repo, &key(n)).unwrap(), "failed to remove {n}");
        }
        assert_eq!(tree.count(&mut repo).unwrap(), 0);
        assert!(tree.first(&mut repo).unwrap().is_none());
    }

    #[test]
    fn remove_of_absent_key_returns_false() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.add(&mut repo, key(1), vec![]).unwrap();
        assert!(!tree.remove(&mut repo, &key(99)).unwrap());
    }

    #[test]
    fn remove_survives_with_leaf_load_balancing_enabled() {
        let mut repo = FakeRepo::default();
        let config = BtreeConfig {
            leaf_load_balancing: true,
            ..small_config()
        };
        let mut tree = Btree::create_empty(&mut repo, config).unwrap();
        for n in 0..40u32 {
            tree.add(&mut repo, key(n), vec![]).unwrap();
        }
        for n in (0..40u32).step_by(2) {
            assert!(tree.remove(&mut repo, &key(n)).unwrap());
        }
        assert_eq!(tree.count(&mut repo).unwrap(), 20);
        for n in (1..40u32).step_by(2) {
            assert!(tree.find(&mut repo, &key(n), FindKind::Any).unwrap().is_some());
        }
    }

    #[test]
    fn values_in_separate_blobs_round_trip_through_the_value_store() {
        let mut repo = FakeRepo::default();
        let config = BtreeConfig {
            is_value_data_in_node_segment: false,
            ..BtreeConfig::default()
        };
        let mut tree = Btree::create_empty(&mut repo, config).unwrap();
        tree.add(&mut repo, key(1), b"payload".to_vec()).unwrap();
        let cursor = tree.find(&mut repo, &key(1), FindKind::Any).unwrap().unwrap();
        assert_eq!(
            tree.get_current_value(&mut repo, &cursor).unwrap(),
            b"payload"
        );
        // The node itself must not carry the bytes inline.
        let step = cursor.path.last().unwrap();
        let node = repo.get(step.node).unwrap().unwrap();
        assert!(matches!(node.slots[step.index].value, SlotValue::Separate { .. }));
    }

    #[test]
    fn remove_current_item_reseats_the_cursor_on_the_next_item() {
        let mut repo = FakeRepo::default();
        let mut tree = Btree::create_empty(&mut repo, BtreeConfig::default()).unwrap();
        tree.add(&mut repo, key(1), vec![]).unwrap();
        tree.add(&mut repo, key(2), vec![]).unwrap();
        tree.add(&mut repo, key(3), vec![]).unwrap();

        let cursor = tree.find(&mut repo, &key(2), FindKind::Any).unwrap().unwrap();
        let reseated = tree.remove_current_item(&mut repo, &cursor).unwrap().unwrap();
        assert_eq!(tree.get_current_key(&mut repo, &reseated).unwrap(), key(3));
        assert_eq!(tree.count(&mut repo).unwrap(), 2);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// In-order traversal of a unique store is strictly increasing
            /// regardless of insertion order, for any set of distinct keys.
            #[test]
            fn in_order_traversal_is_strictly_increasing(
                mut keys in prop::collection::hash_set(0u32..500, 1..80)
                    .prop_map(|s| s.into_iter().collect::<Vec<_>>())
            ) {
                let mut repo = FakeRepo::default();
                let mut tree = Btree::create_empty(&mut repo, small_config()).unwrap();
                for &n in &keys {
                    tree.add(&mut repo, key(n), vec![]).unwrap();
                }

                let mut seen = Vec::new();
                let mut cursor = tree.first(&mut repo).unwrap();
                while let Some(c) = cursor {
                    seen.push(tree.get_current_key(&mut repo, &c).unwrap());
                    cursor = tree.next(&mut repo, &c).unwrap();
                }

                keys.sort_unstable();
                let expected: Vec<Vec<u8>> = keys.into_iter().map(key).collect();
                prop_assert_eq!(seen.clone(), expected);
                prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
