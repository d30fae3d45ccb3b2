//! The seam between the B-tree algorithm and the Transaction Core.
//!
//! All node access goes through the transaction-local node repository
//! view. The B-tree never sees a [`sop_core::ids::PhysicalId`], a `Handle`, or a
//! backend call — it only ever asks this trait for a node by
//! [`sop_core::ids::LogicalId`], or stages an add/update/remove of one.
//! `sop-concurrency`'s implementation buffers all of this in a transaction's
//! working set; nothing reaches the Blob Store or Registry until phase-1
//! commit.

use sop_core::error::Result;
use sop_core::ids::{LogicalId, PhysicalId};
use sop_core::node::Node;

/// Node- and value-level storage view the B-tree algorithm programs against.
///
/// Every method may fetch from, or stage a mutation into, the owning
/// transaction's working set: operations buffer changes locally, and no
/// node write hits the Blob Store or Registry before phase-1 commit
/// begins.
pub trait NodeRepository {
    /// Fetch a node by its logical id, or `Ok(None)` if it has been removed
    /// (or never existed) within this transaction's view.
    fn get(&mut self, logical_id: LogicalId) -> Result<Option<Node>>;

    /// Stage a brand-new node, returning the freshly allocated logical id
    /// that will identify it once this transaction commits.
    fn add(&mut self, node: Node) -> Result<LogicalId>;

    /// Stage an update to a node previously returned by [`NodeRepository::get`]
    /// or [`NodeRepository::add`] within this transaction.
    fn update(&mut self, logical_id: LogicalId, node: Node) -> Result<()>;

    /// Stage removal of a node (used only when a merge during delete empties
    /// a sibling entirely).
    fn remove(&mut self, logical_id: LogicalId) -> Result<()>;

    /// Fetch a separately-stored item value: values not kept inline in a
    /// node live as a separate blob under their own physical id.
    fn get_value(&mut self, value_id: PhysicalId) -> Result<Option<Vec<u8>>>;

    /// Stage a brand-new value blob, returning its physical id.
    fn add_value(&mut self, bytes: Vec<u8>) -> Result<PhysicalId>;

    /// Stage a copy-on-write update of a value blob, returning the fresh
    /// physical id the slot must be updated to reference.
    fn update_value(&mut self, old_value_id: PhysicalId, bytes: Vec<u8>) -> Result<PhysicalId>;

    /// Stage removal of a value blob (its owning slot was removed).
    fn remove_value(&mut self, value_id: PhysicalId) -> Result<()>;
}
