//! Phase-record payloads the Transaction Log carries.
//!
//! This module is the serialized shape of each commit phase's payload,
//! shared by the Transaction Core (which writes these during phase-1
//! commit) and the rollback/recovery machinery in this crate (which reads
//! them back to compensate).

use serde::{Deserialize, Serialize};
use sop_core::ids::{LogicalId, PhysicalId};

/// `commitNewRootNodes`.
pub const PHASE_NEW_ROOT_NODES: u8 = 1;
/// `commitAddedNodes`.
pub const PHASE_ADDED_NODES: u8 = 2;
/// `commitUpdatedNodes`.
pub const PHASE_UPDATED_NODES: u8 = 3;
/// `commitRemovedNodes`.
pub const PHASE_REMOVED_NODES: u8 = 4;
/// `commitStoreInfo`.
pub const PHASE_STORE_INFO: u8 = 5;
/// `commitTrackedItemsValues`.
pub const PHASE_TRACKED_ITEMS_VALUES: u8 = 6;
/// `finalizeCommit`.
pub const PHASE_FINALIZE_COMMIT: u8 = 7;

/// One `(logicalId, physicalId)` pair touched by a commit phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    /// Registry logical ID of the node.
    pub logical_id: LogicalId,
    /// The physical ID written for this phase (the new blob for added
    /// nodes, the freshly staged inactive blob for updated nodes).
    pub physical_id: PhysicalId,
}

/// Payload for [`PHASE_NEW_ROOT_NODES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRootNodesPayload {
    /// Registry table the new root's handle lives in.
    pub table: String,
    /// Store name whose `StoreInfo.root_node_logical_id` changed.
    pub store_name: String,
    /// The new root node.
    pub new_root: NodeRef,
    /// The root logical ID before this commit, to restore on rollback.
    pub previous_root_logical_id: LogicalId,
}

/// Payload for [`PHASE_ADDED_NODES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedNodesPayload {
    /// Registry table the new handles live in.
    pub table: String,
    /// Every node added by this commit.
    pub nodes: Vec<NodeRef>,
}

/// Payload for [`PHASE_UPDATED_NODES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedNodesPayload {
    /// Registry table the updated handles live in.
    pub table: String,
    /// Every node updated by this commit: the logical ID and the freshly
    /// staged (inactive) physical ID.
    pub nodes: Vec<NodeRef>,
}

/// Payload for [`PHASE_REMOVED_NODES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedNodesPayload {
    /// Registry table the removed handles live in.
    pub table: String,
    /// Logical IDs tombstoned by this commit.
    pub logical_ids: Vec<LogicalId>,
}

/// Payload for [`PHASE_STORE_INFO`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfoPayload {
    /// Store name whose count changed.
    pub store_name: String,
    /// Item count delta applied.
    pub delta: i64,
    /// Commit timestamp passed to the merge.
    pub timestamp: i64,
}

/// Payload for [`PHASE_TRACKED_ITEMS_VALUES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedItemsValuesPayload {
    /// Blob table the value blobs live in.
    pub table: String,
    /// Physical IDs of value blobs staged by this commit (only populated
    /// for stores with `is_value_data_in_node_segment = false`).
    pub value_ids: Vec<PhysicalId>,
}

/// Payload for [`PHASE_FINALIZE_COMMIT`]. Carries no compensatable state; its
/// presence just marks that phase-1 ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeCommitPayload {
    /// Every registry table this transaction touched, so phase-2 (and a
    /// sweeper resuming a crashed commit) knows the full set of handles to
    /// verify and flip.
    pub tables: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_round_trip_json() {
        let p = AddedNodesPayload {
            table: "t".into(),
            nodes: vec![NodeRef {
                logical_id: LogicalId::new(),
                physical_id: PhysicalId::new(),
            }],
        };
        let bytes = serde_json::to_vec(&p).unwrap();
        let decoded: AddedNodesPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, p);
    }
}
