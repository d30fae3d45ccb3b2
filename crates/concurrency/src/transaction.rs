//! The Transaction Core: working set, two-phase commit, and rollback.
//!
//! This module implements two commit phases: phase-1 "stage & verify"
//! (lock every touched logical ID, validate the read set against the
//! Registry's current state, write blobs and register/stage handles,
//! append one transaction-log record per phase) and phase-2 "atomic flip"
//! (`Registry::put_many` every updated handle's `IsActiveIDB` in one
//! all-or-nothing batch). [`Transaction`] is the type
//! `sop-engine`'s node-repository adapter programs against — see that
//! crate's `transaction_adapter` module for the `NodeRepository`
//! implementation over this type (orphan-rule-legal only there, since
//! `sop-engine` depends on this crate and not the reverse).

use crate::conflict::{sorted_lock_keys, LockGuard};
use crate::metrics::TransactionMetrics;
use crate::validation::validate_read_set;
use crate::working_set::{NodeState, ValueState, WorkingSet};
use sop_core::error::{Result, SopError};
use sop_core::handle::Handle;
use sop_core::ids::{LogicalId, PhysicalId, TransactionId};
use sop_core::node::Node;
use sop_core::store_info::{CacheConfig, StoreInfo};
use sop_core::time::now_micros;
use sop_core::traits::{BlobStore, L2Cache, Registry, StoreRepository, TransactionLog};
use sop_durability::payload::{
    AddedNodesPayload, FinalizeCommitPayload, NewRootNodesPayload, NodeRef, RemovedNodesPayload,
    StoreInfoPayload, TrackedItemsValuesPayload, UpdatedNodesPayload, PHASE_ADDED_NODES,
    PHASE_FINALIZE_COMMIT, PHASE_NEW_ROOT_NODES, PHASE_REMOVED_NODES, PHASE_STORE_INFO,
    PHASE_TRACKED_ITEMS_VALUES, PHASE_UPDATED_NODES,
};
use sop_durability::RollbackExecutor;
use sop_storage::{DeferredGc, GcTask, MruCache};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TTL a commit's locks are held for. Generous relative to an expected
/// single-node-split commit, short enough that a crashed committer's locks
/// age out well before the Recovery Sweeper's own `max_duration`.
const COMMIT_LOCK_TTL_SECONDS: u64 = 30;

/// How a transaction intends to use the store it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Read-only. Still validates its read set at commit, so a concurrent
    /// writer that invalidated something this transaction read surfaces as
    /// a conflict rather than a silent stale read.
    ForReading,
    /// Read-write. Locks and validates everything it touched.
    ForWriting,
    /// Bypasses locking and optimistic concurrency control entirely. For
    /// bulk loads and single-writer deployments that accept last-writer-wins
    /// semantics in exchange for not paying for conflict detection.
    NoCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// The shared backend handles every transaction against a store commits
/// and rolls back through.
#[derive(Clone)]
pub struct Backends {
    /// C2: logical ID to handle mapping.
    pub registry: Arc<dyn Registry>,
    /// C1: content-addressed node and value blobs.
    pub blob_store: Arc<dyn BlobStore>,
    /// C4: per-process MRU cache of node content, keyed by logical ID.
    pub l1_cache: Arc<MruCache<LogicalId, Node>>,
    /// C3: shared TTL cache of handles/nodes/values, and the commit-lock
    /// service.
    pub l2_cache: Arc<dyn L2Cache>,
    /// C5: per-store metadata (root pointer, item count).
    pub store_repo: Arc<dyn StoreRepository>,
    /// C8: append-only transaction log.
    pub log: Arc<dyn TransactionLog>,
    /// Deferred-deletion queue old physical IDs are enqueued into once a
    /// commit's atomic flip makes them unreachable.
    pub gc: Arc<dyn DeferredGc>,
}

/// One logical transaction against a single store.
///
/// Owns a [`WorkingSet`] the B-tree's node-repository view reads and writes
/// through (via `sop-engine`'s adapter); nothing here reaches a backend
/// until [`Transaction::commit`] runs.
pub struct Transaction {
    id: TransactionId,
    mode: TransactionMode,
    store_name: String,
    registry_table: String,
    blob_table: String,
    backends: Backends,
    cache_config: CacheConfig,
    working_set: WorkingSet,
    original_root: LogicalId,
    pending_root: Option<LogicalId>,
    count_delta: i64,
    started_at: i64,
    status: TransactionStatus,
    metrics: Arc<TransactionMetrics>,
    prepared: Option<PreparedCommit>,
}

/// Everything [`Transaction::phase1_commit`] staged, held until
/// [`Transaction::phase2_commit`] either publishes it (the atomic flip) or
/// an error forces a rollback. Kept separate from the rest of
/// [`Transaction`]'s fields so `phase1_commit` is idempotent under retry —
/// calling it again once `prepared` is populated is a no-op.
struct PreparedCommit {
    guard: Option<LockGuard>,
    flip_handles: Vec<Handle>,
    gc_tasks: Vec<GcTask>,
}

impl Transaction {
    /// Begin a transaction against the store described by `store`.
    pub fn begin(
        mode: TransactionMode,
        store: &StoreInfo,
        cache_config: CacheConfig,
        backends: Backends,
        metrics: Arc<TransactionMetrics>,
    ) -> Self {
        metrics.record_begin();
        Transaction {
            id: TransactionId::new(),
            mode,
            store_name: store.name.clone(),
            registry_table: store.registry_table.clone(),
            blob_table: store.blob_table.clone(),
            backends,
            cache_config,
            working_set: WorkingSet::new(),
            original_root: store.root_node_logical_id,
            pending_root: None,
            count_delta: 0,
            started_at: now_micros(),
            status: TransactionStatus::Active,
            metrics,
            prepared: None,
        }
    }

    /// This transaction's identity — what the transaction log, L2 locks,
    /// and the Recovery Sweeper key off of.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The mode this transaction began with.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Logical ID of the tree's root as this transaction currently sees it
    /// (the original root, or whatever [`Transaction::set_root`] staged).
    pub fn root(&self) -> LogicalId {
        self.pending_root.unwrap_or(self.original_root)
    }

    /// Stage a new root (a B-tree split or a root-collapsing merge changed
    /// which node is the root).
    pub fn set_root(&mut self, new_root: LogicalId) {
        if new_root != self.original_root {
            self.pending_root = Some(new_root);
        } else {
            self.pending_root = None;
        }
    }

    /// Accumulate a signed item-count delta (+1 per insert, -1 per remove)
    /// to be merged into the store's `StoreInfo.count` at commit.
    pub fn bump_count(&mut self, delta: i64) {
        self.count_delta += delta;
    }

    // ---- node repository surface (programmed against by sop-engine's
    // NodeRepository adapter) ----

    /// Fetch a node by logical id, consulting the working set, then L1,
    /// then the Registry/Blob Store (through L2 where enabled).
    pub fn get_node(&mut self, id: LogicalId) -> Result<Option<Node>> {
        if let Some(state) = self.working_set.nodes.get(&id) {
            return Ok(match state {
                NodeState::Added(n) | NodeState::Updated(n) => Some(n.clone()),
                NodeState::Removed => None,
            });
        }
        let handle = match self.fetch_handle(id)? {
            Some(h) => h,
            None => return Ok(None),
        };
        if handle.is_deleted {
            return Ok(None);
        }
        self.working_set.record_read_version(id, handle.version);
        let physical_id = handle.active_physical_id();
        if let Some(node) = self.backends.l1_cache.get(&id) {
            if node.id == physical_id {
                return Ok(Some(node));
            }
        }
        let node = self.fetch_node_blob(physical_id)?;
        if let Some(ref n) = node {
            self.backends.l1_cache.put(id, n.clone());
        }
        Ok(node)
    }

    /// Stage a brand-new node, returning the logical id it will be
    /// registered under once this transaction commits.
    pub fn stage_add_node(&mut self, node: Node) -> Result<LogicalId> {
        let id = LogicalId::new();
        self.working_set.nodes.insert(id, NodeState::Added(node));
        Ok(id)
    }

    /// Stage an update to a previously read or added node.
    pub fn stage_update_node(&mut self, id: LogicalId, node: Node) -> Result<()> {
        match self.working_set.nodes.get(&id) {
            Some(NodeState::Added(_)) => {
                self.working_set.nodes.insert(id, NodeState::Added(node));
            }
            _ => {
                self.working_set.nodes.insert(id, NodeState::Updated(node));
            }
        }
        Ok(())
    }

    /// Stage removal of a node. A node added and then removed within the
    /// same transaction leaves no trace rather than tombstoning a handle
    /// that was never registered.
    pub fn stage_remove_node(&mut self, id: LogicalId) -> Result<()> {
        match self.working_set.nodes.get(&id) {
            Some(NodeState::Added(_)) => {
                self.working_set.nodes.remove(&id);
            }
            _ => {
                self.working_set.nodes.insert(id, NodeState::Removed);
            }
        }
        Ok(())
    }

    /// Fetch a separately-stored item value, consulting the working set,
    /// then the L2 cache, then the Blob Store.
    pub fn get_value(&mut self, id: PhysicalId) -> Result<Option<Vec<u8>>> {
        if let Some(state) = self.working_set.values.get(&id) {
            return Ok(match state {
                ValueState::Added(b) | ValueState::Updated(b) => Some(b.clone()),
                ValueState::Removed => None,
            });
        }
        let cache_key = format!("value:{}:{id}", self.blob_table);
        if self.cache_config.use_ttl {
            if let Some(bytes) = self.backends.l2_cache.get(&cache_key)? {
                return Ok(Some(bytes));
            }
        }
        let bytes = self.backends.blob_store.get(&self.blob_table, id)?;
        if self.cache_config.use_ttl {
            if let Some(ref b) = bytes {
                let _ = self.backends.l2_cache.put(
                    &cache_key,
                    b.clone(),
                    self.cache_config.item_ttl_seconds,
                );
            }
        }
        Ok(bytes)
    }

    /// Stage a brand-new value blob.
    pub fn stage_add_value(&mut self, bytes: Vec<u8>) -> Result<PhysicalId> {
        let id = PhysicalId::new();
        self.working_set.values.insert(id, ValueState::Added(bytes));
        Ok(id)
    }

    /// Stage a copy-on-write update: `old_value_id` is abandoned (reclaimed
    /// by physical GC, never referenced again once the slot is restaged),
    /// and a fresh physical id is returned for the slot to point at.
    pub fn stage_update_value(&mut self, old_value_id: PhysicalId, bytes: Vec<u8>) -> Result<PhysicalId> {
        if matches!(self.working_set.values.get(&old_value_id), Some(ValueState::Added(_))) {
            self.working_set.values.remove(&old_value_id);
        }
        let new_id = PhysicalId::new();
        self.working_set.values.insert(new_id, ValueState::Added(bytes));
        Ok(new_id)
    }

    /// Stage removal of a value blob.
    pub fn stage_remove_value(&mut self, id: PhysicalId) -> Result<()> {
        match self.working_set.values.get(&id) {
            Some(ValueState::Added(_)) => {
                self.working_set.values.remove(&id);
            }
            _ => {
                self.working_set.values.insert(id, ValueState::Removed);
            }
        }
        Ok(())
    }

    // ---- commit / rollback ----

    /// Phase 1 of two-phase commit: lock every touched logical ID, validate
    /// this transaction's read set, stage new/updated/removed nodes and
    /// values, and append every phase's log record. Idempotent: calling it
    /// again after it already succeeded is a no-op, so a caller driving
    /// phase1/phase2 by hand can retry phase 1 alone without
    /// double-staging.
    ///
    /// Does not publish anything — [`Transaction::phase2_commit`] must
    /// follow to make the staged writes visible, or [`Transaction::rollback`]
    /// to discard them.
    pub fn phase1_commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.prepared.is_some() {
            return Ok(());
        }

        let nothing_staged =
            self.working_set.is_empty() && self.pending_root.is_none() && self.count_delta == 0;
        if nothing_staged && self.working_set.read_versions.is_empty() {
            self.prepared = Some(PreparedCommit {
                guard: None,
                flip_handles: Vec::new(),
                gc_tasks: Vec::new(),
            });
            return Ok(());
        }

        debug!(tx = %self.id, store = %self.store_name, "phase-1 commit: staging");
        let write_ids: Vec<LogicalId> = self.working_set.nodes.keys().copied().collect();
        let guard = match self.mode {
            TransactionMode::NoCheck => None,
            TransactionMode::ForReading | TransactionMode::ForWriting => {
                // Even a read-only transaction with nothing to write locks
                // and validates its read set here — otherwise a concurrent
                // writer that invalidated something it read would go
                // undetected.
                let keys = sorted_lock_keys(&self.registry_table, &write_ids);
                let guard = match LockGuard::acquire(
                    self.backends.l2_cache.clone(),
                    COMMIT_LOCK_TTL_SECONDS,
                    keys,
                ) {
                    Ok(g) => g,
                    Err(e) => {
                        warn!(tx = %self.id, error = %e, "phase-1 commit: lock acquisition failed");
                        self.metrics.record_conflict();
                        return Err(e);
                    }
                };
                if let Err(e) = validate_read_set(
                    self.backends.registry.as_ref(),
                    &self.registry_table,
                    &self.working_set.read_versions,
                ) {
                    warn!(tx = %self.id, error = %e, "phase-1 commit: read-set validation failed");
                    guard.release();
                    self.metrics.record_conflict();
                    return Err(e);
                }
                Some(guard)
            }
        };

        if nothing_staged {
            self.prepared = Some(PreparedCommit {
                guard,
                flip_handles: Vec::new(),
                gc_tasks: Vec::new(),
            });
            return Ok(());
        }

        match self.stage_for_commit() {
            Ok((flip_handles, gc_tasks)) => {
                self.prepared = Some(PreparedCommit {
                    guard,
                    flip_handles,
                    gc_tasks,
                });
                Ok(())
            }
            Err(e) => {
                warn!(tx = %self.id, error = %e, "phase-1 commit: staging failed, rolling back");
                self.compensate_partial_commit();
                if let Some(g) = guard {
                    g.release();
                }
                self.status = TransactionStatus::RolledBack;
                self.metrics.record_rollback();
                Err(e)
            }
        }
    }

    /// Phase 2 of two-phase commit: the strict-atomic flip (spec §4.6
    /// "Phase 2 — Flip active"). Re-verifies every handle [`Transaction::
    /// phase1_commit`] staged still carries the version it observed, issues
    /// a single [`Registry::put_many`] toggling every one's active slot,
    /// invalidates caches, enqueues superseded physical IDs for deferred
    /// GC, and deletes this transaction's log.
    ///
    /// # Panics
    /// Does not panic; returns [`SopError::Invariant`] if called before
    /// [`Transaction::phase1_commit`] has staged anything.
    pub fn phase2_commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        let prepared = self.prepared.take().ok_or_else(|| {
            SopError::Invariant("phase2_commit called before phase1_commit staged anything".into())
        })?;

        if let Err(e) = self.reverify_staged(&prepared.flip_handles) {
            warn!(tx = %self.id, error = %e, "phase-2 commit: re-verification failed");
            if let Some(g) = prepared.guard {
                g.release();
            }
            self.compensate_partial_commit();
            self.status = TransactionStatus::RolledBack;
            self.metrics.record_rollback();
            return Err(e);
        }

        let mut flip_handles = prepared.flip_handles;
        for h in flip_handles.iter_mut() {
            h.flip_active();
        }
        if !flip_handles.is_empty() {
            self.backends
                .registry
                .put_many(&self.registry_table, &flip_handles)?;
        }

        self.invalidate_caches(&flip_handles);
        for task in prepared.gc_tasks {
            self.backends.gc.enqueue(task);
        }
        self.backends.log.delete(self.id)?;
        if let Some(g) = prepared.guard {
            g.release();
        }

        self.status = TransactionStatus::Committed;
        self.metrics.record_commit();
        info!(tx = %self.id, store = %self.store_name, handles = flip_handles.len(), "phase-2 commit: flipped active slots");
        Ok(())
    }

    /// Re-read every handle phase 1 staged and confirm its version still
    /// matches what was staged against (spec §4.6 phase-2 step 1). Under
    /// normal operation this can never fail — the commit locks held since
    /// phase 1 forbid any other transaction from touching these handles —
    /// but the check is cheap insurance against a sweeper or an operator
    /// bypassing the lock service directly.
    fn reverify_staged(&self, flip_handles: &[Handle]) -> Result<()> {
        for staged in flip_handles {
            let current = self
                .backends
                .registry
                .get(&self.registry_table, staged.logical_id)?
                .ok_or_else(|| {
                    SopError::Conflict(format!(
                        "logical id {} vanished between phase 1 and phase 2",
                        staged.logical_id
                    ))
                })?;
            if current.version != staged.version {
                return Err(SopError::Conflict(format!(
                    "logical id {} changed from version {} to {} between phase 1 and phase 2",
                    staged.logical_id, staged.version, current.version
                )));
            }
        }
        Ok(())
    }

    /// Run phase 1 then phase 2. On [`SopError::Conflict`] the caller's
    /// documented recovery path is to retry the whole transaction from
    /// `begin` (spec §7) — this method does not loop internally, since
    /// everything staged here was derived from reads that may themselves
    /// now be stale.
    pub fn commit(&mut self) -> Result<()> {
        self.phase1_commit()?;
        self.phase2_commit()
    }

    /// Discard this transaction's working set without touching any
    /// backend it hasn't already written through. If phase 1 had partially
    /// (or fully) staged before this is called, replays and clears
    /// whatever the log still holds for this transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.working_set = WorkingSet::new();
        self.pending_root = None;
        self.count_delta = 0;
        if let Some(prepared) = self.prepared.take() {
            if let Some(g) = prepared.guard {
                g.release();
            }
        }
        let records = self.backends.log.read(self.id)?;
        if !records.is_empty() {
            self.rollback_executor().compensate(&records)?;
            self.backends.log.delete(self.id)?;
        }
        self.status = TransactionStatus::RolledBack;
        self.metrics.record_rollback();
        info!(tx = %self.id, "transaction rolled back");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            _ => Err(SopError::Invariant(
                "transaction has already committed or rolled back".into(),
            )),
        }
    }

    fn fetch_handle(&self, id: LogicalId) -> Result<Option<Handle>> {
        let cache_key = format!("handle:{}:{id}", self.registry_table);
        if self.cache_config.use_ttl {
            if let Some(bytes) = self.backends.l2_cache.get(&cache_key)? {
                if let Some(h) = Handle::from_bytes(&bytes) {
                    return Ok(Some(h));
                }
            }
        }
        let handle = self.backends.registry.get(&self.registry_table, id)?;
        if self.cache_config.use_ttl {
            if let Some(h) = handle {
                let _ = self
                    .backends
                    .l2_cache
                    .put(&cache_key, h.to_bytes().to_vec(), self.cache_config.node_ttl_seconds);
            }
        }
        Ok(handle)
    }

    fn fetch_node_blob(&self, physical_id: PhysicalId) -> Result<Option<Node>> {
        let cache_key = format!("node:{}:{physical_id}", self.registry_table);
        if self.cache_config.use_ttl {
            if let Some(bytes) = self.backends.l2_cache.get(&cache_key)? {
                if let Ok(node) = serde_json::from_slice::<Node>(&bytes) {
                    return Ok(Some(node));
                }
            }
        }
        let bytes = self.backends.blob_store.get(&self.blob_table, physical_id)?;
        match bytes {
            None => Ok(None),
            Some(b) => {
                let node: Node = serde_json::from_slice(&b)?;
                if self.cache_config.use_ttl {
                    let _ = self
                        .backends
                        .l2_cache
                        .put(&cache_key, b, self.cache_config.node_ttl_seconds);
                }
                Ok(Some(node))
            }
        }
    }

    fn rollback_executor(&self) -> RollbackExecutor {
        RollbackExecutor::new(
            self.backends.registry.clone(),
            self.backends.blob_store.clone(),
            self.backends.l2_cache.clone(),
            self.backends.store_repo.clone(),
        )
    }

    /// Best-effort compensation of whatever phases made it to the log
    /// before `stage_and_flip` failed partway through.
    fn compensate_partial_commit(&self) {
        if let Ok(records) = self.backends.log.read(self.id) {
            if !records.is_empty() {
                let _ = self.rollback_executor().compensate(&records);
            }
        }
        let _ = self.backends.log.delete(self.id);
    }

    /// Phase-1 stage & verify: write blobs, register/stage handles, and log
    /// every phase. Every fallible step here runs before any log record is
    /// deleted, so a failure partway through leaves a complete trail for
    /// [`Transaction::compensate_partial_commit`] (or, if the process
    /// crashes first, the Recovery Sweeper) to undo. Returns the handles
    /// [`Transaction::phase2_commit`] must flip, and the physical IDs it
    /// should enqueue for deferred GC once that flip succeeds.
    ///
    /// `AddedNodesPayload`/`UpdatedNodesPayload`/`RemovedNodesPayload`/
    /// `NewRootNodesPayload` all carry `registry_table` as their `table`
    /// field, since `RollbackExecutor` threads one table name through both
    /// its Registry and Blob Store calls for a phase. That keeps handle
    /// compensation exact; the trade-off is that an aborted add's orphaned
    /// node blob (written under `blob_table`) is not proactively deleted by
    /// rollback — it is an unreferenced blob with no live handle pointing
    /// at it, reclaimed later by the physical GC sweep rather than by
    /// rollback itself.
    #[allow(clippy::type_complexity)]
    fn stage_for_commit(&mut self) -> Result<(Vec<Handle>, Vec<GcTask>)> {
        self.stage_values()?;
        let (added_refs, updated_refs, removed_ids, flip_handles, gc_tasks) = self.stage_nodes()?;

        if !added_refs.is_empty() {
            let payload = AddedNodesPayload {
                table: self.registry_table.clone(),
                nodes: added_refs,
            };
            self.backends
                .log
                .append(self.id, PHASE_ADDED_NODES, serde_json::to_vec(&payload)?)?;
        }
        if !updated_refs.is_empty() {
            let payload = UpdatedNodesPayload {
                table: self.registry_table.clone(),
                nodes: updated_refs,
            };
            self.backends
                .log
                .append(self.id, PHASE_UPDATED_NODES, serde_json::to_vec(&payload)?)?;
        }
        if !removed_ids.is_empty() {
            let payload = RemovedNodesPayload {
                table: self.registry_table.clone(),
                logical_ids: removed_ids,
            };
            self.backends
                .log
                .append(self.id, PHASE_REMOVED_NODES, serde_json::to_vec(&payload)?)?;
        }

        if let Some(new_root) = self.pending_root {
            let physical_id = self.physical_id_for_root(new_root)?;
            let payload = NewRootNodesPayload {
                table: self.registry_table.clone(),
                store_name: self.store_name.clone(),
                new_root: NodeRef {
                    logical_id: new_root,
                    physical_id,
                },
                previous_root_logical_id: self.original_root,
            };
            self.backends.log.append(
                self.id,
                PHASE_NEW_ROOT_NODES,
                serde_json::to_vec(&payload)?,
            )?;
            self.backends.store_repo.set_root(&self.store_name, new_root)?;
        }

        if self.count_delta != 0 {
            let timestamp = now_micros();
            let payload = StoreInfoPayload {
                store_name: self.store_name.clone(),
                delta: self.count_delta,
                timestamp,
            };
            self.backends
                .log
                .append(self.id, PHASE_STORE_INFO, serde_json::to_vec(&payload)?)?;
            self.backends
                .store_repo
                .merge_count_delta(&self.store_name, self.count_delta, timestamp)?;
        }

        let payload = FinalizeCommitPayload {
            tables: vec![self.registry_table.clone()],
        };
        self.backends.log.append(
            self.id,
            PHASE_FINALIZE_COMMIT,
            serde_json::to_vec(&payload)?,
        )?;

        Ok((flip_handles, gc_tasks))
    }

    /// Write every staged value blob, logging `commitTrackedItemsValues`
    /// for the ones written (populated only for stores with
    /// `is_value_data_in_node_segment = false`; inline-value stores never
    /// stage a separate value blob).
    fn stage_values(&mut self) -> Result<()> {
        let mut value_ids = Vec::new();
        for (physical_id, state) in self.working_set.values.iter() {
            match state {
                ValueState::Added(bytes) | ValueState::Updated(bytes) => {
                    self.backends
                        .blob_store
                        .put(&self.blob_table, *physical_id, bytes.clone())?;
                    value_ids.push(*physical_id);
                }
                ValueState::Removed => {}
            }
        }
        if !value_ids.is_empty() {
            let payload = TrackedItemsValuesPayload {
                table: self.blob_table.clone(),
                value_ids,
            };
            self.backends.log.append(
                self.id,
                PHASE_TRACKED_ITEMS_VALUES,
                serde_json::to_vec(&payload)?,
            )?;
        }
        Ok(())
    }

    /// Stage every node mutation: added nodes' handles are registered
    /// immediately (version 1, nothing references them yet so there is no
    /// copy-on-write ambiguity to resolve); updated nodes stage their fresh
    /// physical id into the handle's inactive slot, to be flipped visible
    /// only by phase 2; removed nodes are tombstoned immediately.
    #[allow(clippy::type_complexity)]
    fn stage_nodes(
        &mut self,
    ) -> Result<(Vec<NodeRef>, Vec<NodeRef>, Vec<LogicalId>, Vec<Handle>, Vec<GcTask>)> {
        let mut entries: Vec<(LogicalId, NodeState)> = self.working_set.nodes.drain().collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut added_refs = Vec::new();
        let mut updated_refs = Vec::new();
        let mut removed_ids = Vec::new();
        let mut flip_handles = Vec::new();
        let mut gc_tasks = Vec::new();

        for (logical_id, state) in entries {
            match state {
                NodeState::Added(node) => {
                    let physical_id = node.id;
                    self.backends
                        .blob_store
                        .put(&self.blob_table, physical_id, serde_json::to_vec(&node)?)?;
                    let handle = Handle::new_added(logical_id, physical_id);
                    self.backends.registry.put(&self.registry_table, handle)?;
                    added_refs.push(NodeRef {
                        logical_id,
                        physical_id,
                    });
                }
                NodeState::Updated(node) => {
                    let physical_id = node.id;
                    self.backends
                        .blob_store
                        .put(&self.blob_table, physical_id, serde_json::to_vec(&node)?)?;
                    let mut handle = self
                        .backends
                        .registry
                        .get(&self.registry_table, logical_id)?
                        .ok_or_else(|| {
                            SopError::Invariant(format!(
                                "no handle for updated node {logical_id}"
                            ))
                        })?;
                    // The currently-active copy becomes garbage the moment
                    // phase 2 flips this handle; queue it now so phase 2 only
                    // has to enqueue, not recompute, the superseded slot.
                    gc_tasks.push(GcTask {
                        table: self.registry_table.clone(),
                        logical_id,
                        physical_id: handle.active_physical_id(),
                    });
                    handle.stage_inactive(physical_id, self.started_at);
                    self.backends.registry.put(&self.registry_table, handle)?;
                    updated_refs.push(NodeRef {
                        logical_id,
                        physical_id,
                    });
                    flip_handles.push(handle);
                }
                NodeState::Removed => {
                    let mut handle = self
                        .backends
                        .registry
                        .get(&self.registry_table, logical_id)?
                        .ok_or_else(|| {
                            SopError::Invariant(format!(
                                "no handle for removed node {logical_id}"
                            ))
                        })?;
                    gc_tasks.push(GcTask {
                        table: self.registry_table.clone(),
                        logical_id,
                        physical_id: handle.active_physical_id(),
                    });
                    handle.is_deleted = true;
                    self.backends.registry.put(&self.registry_table, handle)?;
                    removed_ids.push(logical_id);
                }
            }
        }
        Ok((added_refs, updated_refs, removed_ids, flip_handles, gc_tasks))
    }

    fn physical_id_for_root(&self, logical_id: LogicalId) -> Result<PhysicalId> {
        self.backends
            .registry
            .get(&self.registry_table, logical_id)?
            .map(|h| h.active_physical_id())
            .ok_or_else(|| SopError::Invariant(format!("no handle for new root {logical_id}")))
    }

    fn invalidate_caches(&self, flipped: &[Handle]) {
        self.backends.l1_cache.invalidate(&self.original_root);
        let _ = self
            .backends
            .l2_cache
            .invalidate(&format!("handle:{}:{}", self.registry_table, self.original_root));
        for h in flipped {
            self.backends.l1_cache.invalidate(&h.logical_id);
            let _ = self.backends.l2_cache.invalidate(&format!(
                "handle:{}:{}",
                self.registry_table, h.logical_id
            ));
            let _ = self.backends.l2_cache.invalidate(&format!(
                "node:{}:{}",
                self.registry_table,
                h.active_physical_id()
            ));
        }
        if let Some(new_root) = self.pending_root {
            self.backends.l1_cache.invalidate(&new_root);
            let _ = self
                .backends
                .l2_cache
                .invalidate(&format!("handle:{}:{new_root}", self.registry_table));
        }
    }
}
