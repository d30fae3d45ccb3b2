//! Per-store metadata and the options a store is opened or created with.
//!
//! A `StoreInfo` is created once and, from then on, only its `count` and
//! `timestamp` fields ever change — everything else is fixed for the
//! store's lifetime and must match on re-open or the open call fails with
//! [`crate::SopError::ConfigMismatch`].

use crate::ids::LogicalId;
use serde::{Deserialize, Serialize};

/// Cache TTL configuration for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L2 TTL for node blobs, in seconds.
    pub node_ttl_seconds: u64,
    /// L2 TTL for item/value blobs, in seconds.
    pub item_ttl_seconds: u64,
    /// Whether the L2 cache is consulted at all; stores that disable it fall
    /// through to the backing Registry/Blob Store on every access.
    pub use_ttl: bool,
}

impl Default for CacheConfig {
    /// 6-hour TTL for both node and item entries, cache enabled — the
    /// defaults this implementation picked for spec.md's open question on
    /// TTL values (see DESIGN.md).
    fn default() -> Self {
        CacheConfig {
            node_ttl_seconds: 6 * 60 * 60,
            item_ttl_seconds: 6 * 60 * 60,
            use_ttl: true,
        }
    }
}

/// Options a store is created or re-opened with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Fixed slot capacity per node. Must be at least 4.
    pub slot_length: u16,
    /// Whether keys must be distinct across the whole tree.
    pub is_unique: bool,
    /// Whether values are stored inline in their slot (`true`) or as a
    /// separate blob referenced by `ValueID` (`false`).
    pub is_value_data_in_node_segment: bool,
    /// Whether leaf underflow triggers rebalancing with an adjacent sibling
    /// before falling back to a merge.
    pub leaf_load_balancing: bool,
    /// Human-readable description, stored verbatim in `StoreInfo`.
    pub description: String,
    /// Base folder for a filesystem-backed Blob Store implementation. Not
    /// meaningful for in-memory backends.
    pub blob_store_base_folder_path: String,
    /// Cache TTL configuration.
    pub cache_config: CacheConfig,
}

impl StoreOptions {
    /// Validate option values that spec.md constrains regardless of backend
    /// (`slotLength: u16 (≥4)`).
    pub fn validate(&self) -> Result<(), String> {
        if self.slot_length < 4 {
            return Err(format!(
                "slot_length must be >= 4, got {}",
                self.slot_length
            ));
        }
        Ok(())
    }

    /// True if `other` describes the same store shape as `self` — the check
    /// performed on re-open, which fails with `ConfigMismatch` otherwise.
    pub fn matches(&self, other: &StoreOptions) -> bool {
        self.slot_length == other.slot_length
            && self.is_unique == other.is_unique
            && self.is_value_data_in_node_segment == other.is_value_data_in_node_segment
            && self.leaf_load_balancing == other.leaf_load_balancing
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            slot_length: 8,
            is_unique: true,
            is_value_data_in_node_segment: true,
            leaf_load_balancing: false,
            description: String::new(),
            blob_store_base_folder_path: String::new(),
            cache_config: CacheConfig::default(),
        }
    }
}

/// Persisted store metadata.
///
/// Created once by the store that first opens a given name; every
/// subsequent open of that name reads this back and validates the caller's
/// [`StoreOptions`] against it. Only `count`, `count_delta`, and `timestamp`
/// are ever updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name; also the registry/blob table namespace root.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Logical ID of the tree's root node.
    pub root_node_logical_id: LogicalId,
    /// Fixed slot capacity, copied from the creating [`StoreOptions`].
    pub slot_length: u16,
    /// Authoritative item count as of `timestamp`.
    pub count: i64,
    /// Pending delta not yet folded into `count` by a winning writer; merged
    /// additively on update.
    pub count_delta: i64,
    /// Whether keys are unique across the tree.
    pub is_unique: bool,
    /// Whether values are stored inline or as separate blobs.
    pub is_value_data_in_node_segment: bool,
    /// Whether leaf underflow triggers load-balancing before merging.
    pub leaf_load_balancing: bool,
    /// Registry backend namespace.
    pub registry_table: String,
    /// Blob Store backend namespace.
    pub blob_table: String,
    /// Microsecond timestamp of the last `count`/`count_delta` update.
    pub timestamp: i64,
}

impl StoreInfo {
    /// Build a fresh `StoreInfo` for a store being created for the first
    /// time.
    pub fn new(
        name: impl Into<String>,
        options: &StoreOptions,
        root_node_logical_id: LogicalId,
        now_micros: i64,
    ) -> Self {
        let name = name.into();
        StoreInfo {
            registry_table: format!("{name}.registry"),
            blob_table: format!("{name}.blobs"),
            name,
            description: options.description.clone(),
            root_node_logical_id,
            slot_length: options.slot_length,
            count: 0,
            count_delta: 0,
            is_unique: options.is_unique,
            is_value_data_in_node_segment: options.is_value_data_in_node_segment,
            leaf_load_balancing: options.leaf_load_balancing,
            timestamp: now_micros,
        }
    }

    /// The `StoreOptions` this `StoreInfo` was created with, for re-open
    /// validation.
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            slot_length: self.slot_length,
            is_unique: self.is_unique,
            is_value_data_in_node_segment: self.is_value_data_in_node_segment,
            leaf_load_balancing: self.leaf_load_balancing,
            description: self.description.clone(),
            blob_store_base_folder_path: String::new(),
            cache_config: CacheConfig::default(),
        }
    }

    /// Apply a committing transaction's item-count delta: `count` always
    /// folds in `delta` additively, and `timestamp` advances only if
    /// `incoming_timestamp` is newer than what's already recorded.
    pub fn merge_count_delta(&mut self, delta: i64, incoming_timestamp: i64) {
        self.count += delta;
        if incoming_timestamp > self.timestamp {
            self.timestamp = incoming_timestamp;
        }
    }
}
