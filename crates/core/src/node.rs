//! B-tree node payloads.
//!
//! A [`Node`] is a physically-addressed (by [`PhysicalId`]) page of an
//! ordered [`Slot`] array plus, for internal nodes, one more child logical
//! ID than it has slots. Nodes are looked up by logical ID through a
//! `Handle` (see [`crate::handle`]) and never reference each other by
//! physical ID — only by the logical ID the Registry resolves.

use crate::ids::{ItemId, LogicalId, PhysicalId};
use serde::{Deserialize, Serialize};

/// Where a slot's value lives.
///
/// A store is opened with `is_value_data_in_node_segment` fixed for its
/// lifetime; every slot in that store uses the matching variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotValue {
    /// The value bytes are stored inline in this slot.
    InNode(Vec<u8>),
    /// The value lives in its own blob, addressed by `value_id`, with its
    /// own independent version counter.
    Separate {
        /// Physical ID of the value's blob.
        value_id: PhysicalId,
        /// Version of the value blob (bumped on each update, independent of
        /// the node's own version).
        value_version: u32,
    },
}

/// One ordered entry in a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Distinguishes this item from others with an equal key in a
    /// non-unique store, and is the target of `find_with_id`.
    pub item_id: ItemId,
    /// Serialized key bytes, ordered per the store's [`crate::KeyComparator`].
    pub key: Vec<u8>,
    /// The value, in-node or in a separate blob.
    pub value: SlotValue,
}

impl Slot {
    /// Build a slot whose value is stored inline.
    pub fn in_node(item_id: ItemId, key: Vec<u8>, value: Vec<u8>) -> Self {
        Slot {
            item_id,
            key,
            value: SlotValue::InNode(value),
        }
    }

    /// Build a slot whose value lives in a separate blob.
    pub fn separate(item_id: ItemId, key: Vec<u8>, value_id: PhysicalId) -> Self {
        Slot {
            item_id,
            key,
            value: SlotValue::Separate {
                value_id,
                value_version: 1,
            },
        }
    }
}

/// A B-tree node.
///
/// Invariant: `slots.len() <= slot_length` always; for internal nodes
/// `children.len() == slots.len() + 1`; leaves have `children.is_empty()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Physical identity of this node's blob.
    pub id: PhysicalId,
    /// Node version, incremented whenever the node's blob content changes.
    pub version: u32,
    /// Fixed slot capacity for the store this node belongs to.
    pub slot_length: u16,
    /// Ordered, comparator-sorted slots.
    pub slots: Vec<Slot>,
    /// Child logical IDs. Empty for a leaf; otherwise one more entry than
    /// `slots` (the child before `slots[i]` is `children[i]`, the child
    /// after the last slot is `children[slots.len()]`).
    pub children: Vec<LogicalId>,
}

impl Node {
    /// A new, empty leaf node.
    pub fn new_leaf(id: PhysicalId, slot_length: u16) -> Self {
        Node {
            id,
            version: 1,
            slot_length,
            slots: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A new, empty internal node with the given initial children.
    pub fn new_internal(id: PhysicalId, slot_length: u16, children: Vec<LogicalId>) -> Self {
        Node {
            id,
            version: 1,
            slot_length,
            slots: Vec::new(),
            children,
        }
    }

    /// True if this node has no children (a leaf).
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of slots currently occupied.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// True if the node is at capacity and a split is required before
    /// another insertion.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.slot_length as usize
    }

    /// Minimum occupancy below which a leaf underflows and becomes eligible
    /// for load-balancing or merging. Classic B-tree minimum is
    /// `ceil(slot_length / 2) - 1`.
    pub fn min_occupancy(&self) -> usize {
        (self.slot_length as usize).div_ceil(2).saturating_sub(1)
    }

    /// True if this node has fewer slots than [`Node::min_occupancy`].
    pub fn is_underflowing(&self) -> bool {
        self.slots.len() < self.min_occupancy()
    }

    /// Validate the node's internal shape invariant. Returns `Err` with a
    /// description if violated.
    pub fn check_invariant(&self) -> Result<(), String> {
        if self.slots.len() > self.slot_length as usize {
            return Err(format!(
                "slot_count {} exceeds slot_length {}",
                self.slots.len(),
                self.slot_length
            ));
        }
        if !self.children.is_empty() && self.children.len() != self.slots.len() + 1 {
            return Err(format!(
                "internal node has {} children but {} slots (expected {})",
                self.children.len(),
                self.slots.len(),
                self.slots.len() + 1
            ));
        }
        Ok(())
    }
}
