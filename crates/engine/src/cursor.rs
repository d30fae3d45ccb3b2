//! Cursor path type.
//!
//! A single logical cursor exists per open B-tree instance within a
//! transaction. A [`Cursor`] is a root-to-item path: every step but the
//! last records the child edge taken to descend; the last records the slot
//! index of the item the cursor is seated on.

use sop_core::ids::LogicalId;

/// One step of a traversal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// Logical id of the node visited at this step.
    pub node: LogicalId,
    /// Child index (non-final steps) or slot index (the final step).
    pub index: usize,
}

/// A single logical cursor's position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub(crate) path: Vec<PathStep>,
}

impl Cursor {
    /// True if this cursor is seated on an item (as opposed to an empty
    /// tree, or one exhausted by `next`/`previous`).
    pub fn is_valid(&self) -> bool {
        !self.path.is_empty()
    }
}
