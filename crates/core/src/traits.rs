//! Backend contracts.
//!
//! Each trait here is one of spec.md's leaf components (C1-C5, C8): an
//! abstraction the Transaction Core (built in `sop-concurrency`) programs
//! against, with concrete implementations supplied by `sop-storage` and
//! `sop-durability`. Splitting them out here — rather than defining them
//! alongside their implementations — is what lets higher crates depend on
//! the contract without depending on any particular backend.

use crate::error::Result;
use crate::handle::Handle;
use crate::ids::{LogicalId, PhysicalId, TransactionId};
use crate::node::Node;
use crate::store_info::StoreInfo;

/// C1: content-addressed storage of node and value blobs.
///
/// Every blob is keyed by its own [`PhysicalId`] under a per-store "blob
/// table" namespace. Blobs are immutable once written — an update writes a
/// *new* physical ID rather than overwriting one (copy-on-write), so `put`
/// never needs to merge with a prior value.
pub trait BlobStore: Send + Sync {
    /// Fetch a blob's raw bytes, or `Ok(None)` if `id` has no blob.
    fn get(&self, table: &str, id: PhysicalId) -> Result<Option<Vec<u8>>>;

    /// Write a blob's raw bytes under `id`. Overwriting an existing `id` is
    /// allowed only for implementations that re-use physical IDs across
    /// retries of the same staged write; callers never rely on it.
    fn put(&self, table: &str, id: PhysicalId, bytes: Vec<u8>) -> Result<()>;

    /// Remove a blob. Used by rollback (undo a staged write) and by GC of
    /// tombstoned handles. Removing a nonexistent blob is not an error.
    fn delete(&self, table: &str, id: PhysicalId) -> Result<()>;
}

/// C2: durable mapping `LogicalID -> Handle`.
///
/// Supports all-or-nothing batch updates so phase-2 commit can flip every
/// handle a transaction touched as a single atomic step from the caller's
/// point of view.
pub trait Registry: Send + Sync {
    /// Fetch a handle, or `Ok(None)` if `id` has no handle.
    fn get(&self, table: &str, id: LogicalId) -> Result<Option<Handle>>;

    /// Fetch several handles in one call, preserving the input order with
    /// `None` for any ID that has no handle.
    fn get_many(&self, table: &str, ids: &[LogicalId]) -> Result<Vec<Option<Handle>>>;

    /// Insert or replace a single handle.
    fn put(&self, table: &str, handle: Handle) -> Result<()>;

    /// Apply every handle update in `handles`, or none of them. Used by
    /// phase-2 commit's atomic flip of every handle a transaction wrote.
    fn put_many(&self, table: &str, handles: &[Handle]) -> Result<()>;

    /// Remove a handle entirely (used only after GC of a tombstoned,
    /// unreferenced logical ID — not the normal delete path, which sets
    /// `Handle::is_deleted` instead).
    fn delete(&self, table: &str, id: LogicalId) -> Result<()>;
}

/// C3: shared, cross-process TTL cache of handles, nodes, store-info, and
/// coordination locks.
///
/// Entries expire on their own; `get` returning `Ok(None)` is indistinguishable
/// between "never set" and "expired" by design, since both mean "go to the
/// backing store."
pub trait L2Cache: Send + Sync {
    /// Fetch a cached blob of opaque bytes (a serialized `Handle`, `Node`,
    /// or `StoreInfo`) under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Cache `bytes` under `key` for `ttl_seconds`.
    fn put(&self, key: &str, bytes: Vec<u8>, ttl_seconds: u64) -> Result<()>;

    /// Evict a cache entry immediately (used when a write makes a cached
    /// value stale).
    fn invalidate(&self, key: &str) -> Result<()>;

    /// Acquire a distributed lock named `key`, held for at most
    /// `ttl_seconds`, for the duration of phase-1 commit's verify step.
    /// Returns `true` if the lock was acquired, `false` if another holder
    /// already has it.
    fn try_lock(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Release a lock previously acquired with `try_lock`. Releasing a lock
    /// this caller does not hold (because it expired) is not an error.
    fn unlock(&self, key: &str) -> Result<()>;
}

/// C5: per-store metadata, keyed by store name.
pub trait StoreRepository: Send + Sync {
    /// Fetch a store's metadata, or `Ok(None)` if no store with that name
    /// has been created.
    fn get(&self, name: &str) -> Result<Option<StoreInfo>>;

    /// Create a new store's metadata. Fails with
    /// [`crate::SopError::ConfigMismatch`] if a store with this name already
    /// exists.
    fn create(&self, info: StoreInfo) -> Result<()>;

    /// Merge a committing transaction's item-count delta into the stored
    /// `StoreInfo`, returning the updated record.
    fn merge_count_delta(&self, name: &str, delta: i64, timestamp: i64) -> Result<StoreInfo>;

    /// Update the tree's root logical ID, for when a B-tree split or merge
    /// changes which node is the root. Compensated on rollback of a
    /// `commitNewRootNodes` phase by setting it back to the prior value.
    fn set_root(&self, name: &str, root_node_logical_id: LogicalId) -> Result<()>;
}

/// A single phase record of a transaction's commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Which commit phase this record came from.
    pub phase_tag: u8,
    /// Monotone sequence number within the transaction's log.
    pub sequence_number: u64,
    /// Serialized phase payload (the logical/physical IDs and table names
    /// the Recovery Sweeper needs to compensate this phase).
    pub payload: Vec<u8>,
}

/// C8: append-only, ordered phase records keyed by transaction ID.
///
/// The Transaction Core appends one record per commit phase as it runs;
/// the Recovery Sweeper (C9, built on this trait rather than a separate
/// one — it only ever reads and deletes) scans for transactions whose log
/// is older than their declared max duration and compensates.
pub trait TransactionLog: Send + Sync {
    /// Append one phase record for `tx_id`.
    fn append(&self, tx_id: TransactionId, phase_tag: u8, payload: Vec<u8>) -> Result<()>;

    /// Read every record logged so far for `tx_id`, in append order.
    fn read(&self, tx_id: TransactionId) -> Result<Vec<LogRecord>>;

    /// Delete every record for `tx_id` — called once a commit finalizes
    /// (`finalizeCommit`) or a rollback completes.
    fn delete(&self, tx_id: TransactionId) -> Result<()>;

    /// List every transaction ID with at least one log record, alongside
    /// the wall-clock time (microseconds) its first record was appended.
    /// The Recovery Sweeper uses this to find transactions older than their
    /// max duration.
    fn list_active(&self) -> Result<Vec<(TransactionId, i64)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn backend_traits_are_object_safe_and_send_sync() {
        assert_send_sync::<Box<dyn BlobStore>>();
        assert_send_sync::<Box<dyn Registry>>();
        assert_send_sync::<Box<dyn L2Cache>>();
        assert_send_sync::<Box<dyn StoreRepository>>();
        assert_send_sync::<Box<dyn TransactionLog>>();
    }
}
