//! C5: per-store metadata repository.
//!
//! Updating a store's metadata merges `count` by adding the caller's count
//! delta into the stored count, so concurrent transactions can add/remove
//! items without a strict lock on the store row. [`MemStoreRepository`] is
//! the in-memory reference implementation; a real backend would apply the
//! same merge under whatever CAS/conditional-write primitive it has.

use parking_lot::Mutex;
use sop_core::error::{Result, SopError};
use sop_core::store_info::StoreInfo;
use sop_core::traits::StoreRepository;
use std::collections::HashMap;

/// In-memory `StoreRepository`.
#[derive(Default)]
pub struct MemStoreRepository {
    stores: Mutex<HashMap<String, StoreInfo>>,
}

impl MemStoreRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreRepository for MemStoreRepository {
    fn get(&self, name: &str) -> Result<Option<StoreInfo>> {
        Ok(self.stores.lock().get(name).cloned())
    }

    fn create(&self, info: StoreInfo) -> Result<()> {
        let mut stores = self.stores.lock();
        if stores.contains_key(&info.name) {
            return Err(SopError::ConfigMismatch(format!(
                "store '{}' already exists",
                info.name
            )));
        }
        stores.insert(info.name.clone(), info);
        Ok(())
    }

    fn merge_count_delta(&self, name: &str, delta: i64, timestamp: i64) -> Result<StoreInfo> {
        let mut stores = self.stores.lock();
        let info = stores
            .get_mut(name)
            .ok_or_else(|| SopError::Invariant(format!("store '{name}' has no StoreInfo")))?;
        info.merge_count_delta(delta, timestamp);
        Ok(info.clone())
    }

    fn set_root(&self, name: &str, root_node_logical_id: sop_core::ids::LogicalId) -> Result<()> {
        let mut stores = self.stores.lock();
        let info = stores
            .get_mut(name)
            .ok_or_else(|| SopError::Invariant(format!("store '{name}' has no StoreInfo")))?;
        info.root_node_logical_id = root_node_logical_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::ids::LogicalId;
    use sop_core::store_info::StoreOptions;

    fn sample(name: &str) -> StoreInfo {
        StoreInfo::new(name, &StoreOptions::default(), LogicalId::new(), 0)
    }

    #[test]
    fn get_of_unknown_store_is_none() {
        let repo = MemStoreRepository::new();
        assert_eq!(repo.get("s").unwrap(), None);
    }

    #[test]
    fn create_then_get_round_trips() {
        let repo = MemStoreRepository::new();
        repo.create(sample("s")).unwrap();
        assert!(repo.get("s").unwrap().is_some());
    }

    #[test]
    fn create_twice_fails_config_mismatch() {
        let repo = MemStoreRepository::new();
        repo.create(sample("s")).unwrap();
        let err = repo.create(sample("s")).unwrap_err();
        assert!(matches!(err, SopError::ConfigMismatch(_)));
    }

    #[test]
    fn merge_count_delta_accumulates() {
        let repo = MemStoreRepository::new();
        repo.create(sample("s")).unwrap();
        repo.merge_count_delta("s", 3, 10).unwrap();
        let info = repo.merge_count_delta("s", 2, 20).unwrap();
        assert_eq!(info.count, 5);
        assert_eq!(info.timestamp, 20);
    }

    #[test]
    fn merge_count_delta_on_unknown_store_is_invariant_error() {
        let repo = MemStoreRepository::new();
        let err = repo.merge_count_delta("nope", 1, 0).unwrap_err();
        assert!(matches!(err, SopError::Invariant(_)));
    }

    #[test]
    fn set_root_updates_root_logical_id() {
        let repo = MemStoreRepository::new();
        repo.create(sample("s")).unwrap();
        let new_root = LogicalId::new();
        repo.set_root("s", new_root).unwrap();
        assert_eq!(repo.get("s").unwrap().unwrap().root_node_logical_id, new_root);
    }
}
