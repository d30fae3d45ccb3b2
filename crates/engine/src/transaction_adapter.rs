//! Implements [`NodeRepository`] for `sop-concurrency`'s [`Transaction`].
//!
//! This impl lives here rather than in `sop-concurrency` itself: the
//! dependency runs `sop-engine -> sop-concurrency`, so `Transaction` is a
//! foreign type from this crate's point of view, and Rust's orphan rule
//! only allows implementing a *local* trait (`NodeRepository`, defined in
//! this crate) for a foreign type — not the reverse. `sop-concurrency`
//! exposes plain `get_node`/`stage_add_node`/... methods with no knowledge
//! of the B-tree's algorithm; this adapter is the thin seam that lets the
//! [`crate::Btree`] address them through the repository view it expects.

use crate::node_repository::NodeRepository;
use sop_core::error::Result;
use sop_core::ids::{LogicalId, PhysicalId};
use sop_core::node::Node;
use sop_concurrency::Transaction;

impl NodeRepository for Transaction {
    fn get(&mut self, logical_id: LogicalId) -> Result<Option<Node>> {
        self.get_node(logical_id)
    }

    fn add(&mut self, node: Node) -> Result<LogicalId> {
        self.stage_add_node(node)
    }

    fn update(&mut self, logical_id: LogicalId, node: Node) -> Result<()> {
        self.stage_update_node(logical_id, node)
    }

    fn remove(&mut self, logical_id: LogicalId) -> Result<()> {
        self.stage_remove_node(logical_id)
    }

    fn get_value(&mut self, value_id: PhysicalId) -> Result<Option<Vec<u8>>> {
        self.get_value(value_id)
    }

    fn add_value(&mut self, bytes: Vec<u8>) -> Result<PhysicalId> {
        self.stage_add_value(bytes)
    }

    fn update_value(&mut self, old_value_id: PhysicalId, bytes: Vec<u8>) -> Result<PhysicalId> {
        self.stage_update_value(old_value_id, bytes)
    }

    fn remove_value(&mut self, value_id: PhysicalId) -> Result<()> {
        self.stage_remove_value(value_id)
    }
}
