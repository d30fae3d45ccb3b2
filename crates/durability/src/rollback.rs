//! Rollback compensation, shared by the Transaction Core's explicit
//! `rollback()` call and the Recovery Sweeper.
//!
//! Rollback replays a transaction's log in reverse phase order, undoing
//! whatever each phase tag staged. Because a transaction's log is deleted
//! only once phase-2 commit succeeds, a log that still exists — regardless
//! of which phase tags it holds — means phase-2 never ran: nothing it
//! staged was ever made visible by the atomic flip, so compensating is
//! always safe, never a double-undo of a published commit.

use crate::payload::{
    AddedNodesPayload, NewRootNodesPayload, RemovedNodesPayload, TrackedItemsValuesPayload,
    UpdatedNodesPayload, PHASE_ADDED_NODES, PHASE_FINALIZE_COMMIT, PHASE_NEW_ROOT_NODES,
    PHASE_REMOVED_NODES, PHASE_STORE_INFO, PHASE_TRACKED_ITEMS_VALUES, PHASE_UPDATED_NODES,
};
use sop_core::error::Result;
use sop_core::traits::{BlobStore, L2Cache, LogRecord, Registry, StoreRepository};
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes the compensation each logged commit phase requires on rollback.
pub struct RollbackExecutor {
    registry: Arc<dyn Registry>,
    blob_store: Arc<dyn BlobStore>,
    l2_cache: Arc<dyn L2Cache>,
    store_repo: Arc<dyn StoreRepository>,
}

impl RollbackExecutor {
    /// Build an executor over the given backends.
    pub fn new(
        registry: Arc<dyn Registry>,
        blob_store: Arc<dyn BlobStore>,
        l2_cache: Arc<dyn L2Cache>,
        store_repo: Arc<dyn StoreRepository>,
    ) -> Self {
        RollbackExecutor {
            registry,
            blob_store,
            l2_cache,
            store_repo,
        }
    }

    /// Compensate every phase record in `records`, highest phase tag first.
    /// Idempotent: re-running over the same records (or a prefix of them,
    /// as happens when a crash interrupts rollback itself) is safe because
    /// every compensation here is itself an idempotent delete/clear.
    pub fn compensate(&self, records: &[LogRecord]) -> Result<()> {
        let mut sorted: Vec<&LogRecord> = records.iter().collect();
        sorted.sort_by(|a, b| b.phase_tag.cmp(&a.phase_tag));

        for record in sorted {
            match record.phase_tag {
                PHASE_FINALIZE_COMMIT => {
                    debug!("rollback: finalizeCommit marker, no compensation");
                }
                PHASE_STORE_INFO => {
                    debug!("rollback: commitStoreInfo, no compensation (delta merges next success)");
                }
                PHASE_TRACKED_ITEMS_VALUES => self.compensate_tracked_values(record)?,
                PHASE_NEW_ROOT_NODES => self.compensate_new_root(record)?,
                PHASE_REMOVED_NODES => self.compensate_removed_nodes(record)?,
                PHASE_UPDATED_NODES => self.compensate_updated_nodes(record)?,
                PHASE_ADDED_NODES => self.compensate_added_nodes(record)?,
                other => {
                    warn!(phase_tag = other, "rollback: unknown phase tag, skipping");
                }
            }
        }
        Ok(())
    }

    fn compensate_added_nodes(&self, record: &LogRecord) -> Result<()> {
        let payload: AddedNodesPayload = serde_json::from_slice(&record.payload)?;
        for node in &payload.nodes {
            self.blob_store.delete(&payload.table, node.physical_id)?;
            self.l2_cache
                .invalidate(&format!("handle:{}:{}", payload.table, node.logical_id))?;
            self.l2_cache
                .invalidate(&format!("node:{}:{}", payload.table, node.physical_id))?;
            self.registry.delete(&payload.table, node.logical_id)?;
        }
        Ok(())
    }

    fn compensate_updated_nodes(&self, record: &LogRecord) -> Result<()> {
        let payload: UpdatedNodesPayload = serde_json::from_slice(&record.payload)?;
        for node in &payload.nodes {
            self.blob_store.delete(&payload.table, node.physical_id)?;
            self.l2_cache
                .invalidate(&format!("node:{}:{}", payload.table, node.physical_id))?;
            if let Some(mut handle) = self.registry.get(&payload.table, node.logical_id)? {
                handle.clear_work_in_progress();
                self.registry.put(&payload.table, handle)?;
                self.l2_cache
                    .invalidate(&format!("handle:{}:{}", payload.table, node.logical_id))?;
            }
        }
        Ok(())
    }

    fn compensate_removed_nodes(&self, record: &LogRecord) -> Result<()> {
        let payload: RemovedNodesPayload = serde_json::from_slice(&record.payload)?;
        for logical_id in &payload.logical_ids {
            if let Some(mut handle) = self.registry.get(&payload.table, *logical_id)? {
                handle.is_deleted = false;
                handle.clear_work_in_progress();
                self.registry.put(&payload.table, handle)?;
                self.l2_cache
                    .invalidate(&format!("handle:{}:{}", payload.table, logical_id))?;
            }
        }
        Ok(())
    }

    fn compensate_new_root(&self, record: &LogRecord) -> Result<()> {
        let payload: NewRootNodesPayload = serde_json::from_slice(&record.payload)?;
        self.blob_store
            .delete(&payload.table, payload.new_root.physical_id)?;
        self.l2_cache.invalidate(&format!(
            "handle:{}:{}",
            payload.table, payload.new_root.logical_id
        ))?;
        self.registry
            .delete(&payload.table, payload.new_root.logical_id)?;
        self.store_repo
            .set_root(&payload.store_name, payload.previous_root_logical_id)?;
        Ok(())
    }

    fn compensate_tracked_values(&self, record: &LogRecord) -> Result<()> {
        let payload: TrackedItemsValuesPayload = serde_json::from_slice(&record.payload)?;
        for value_id in &payload.value_ids {
            self.blob_store.delete(&payload.table, *value_id)?;
            self.l2_cache
                .invalidate(&format!("value:{}:{}", payload.table, value_id))?;
        }
        Ok(())
    }
}
