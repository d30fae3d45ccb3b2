//! C2: the `LogicalID -> Handle` Registry.
//!
//! [`MemRegistry`] is the in-memory reference implementation every higher
//! crate tests against. Batch writes ([`sop_core::traits::Registry::put_many`])
//! take a single mutex for the duration of the batch so that from any other
//! thread's point of view the whole batch either hasn't happened yet or has
//! happened completely — the all-or-nothing guarantee a Registry backend
//! must provide.

use dashmap::DashMap;
use parking_lot::Mutex;
use sop_core::error::Result;
use sop_core::handle::Handle;
use sop_core::ids::LogicalId;
use sop_core::traits::Registry;

/// In-memory `Registry`.
#[derive(Debug, Default)]
pub struct MemRegistry {
    handles: DashMap<(String, LogicalId), Handle>,
    // Held for the duration of put_many so a batch is visible all-at-once.
    batch_lock: Mutex<()>,
}

impl MemRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles across all tables.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no handles are held.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Registry for MemRegistry {
    fn get(&self, table: &str, id: LogicalId) -> Result<Option<Handle>> {
        Ok(self.handles.get(&(table.to_string(), id)).map(|h| *h))
    }

    fn get_many(&self, table: &str, ids: &[LogicalId]) -> Result<Vec<Option<Handle>>> {
        Ok(ids
            .iter()
            .map(|id| self.handles.get(&(table.to_string(), *id)).map(|h| *h))
            .collect())
    }

    fn put(&self, table: &str, handle: Handle) -> Result<()> {
        self.handles
            .insert((table.to_string(), handle.logical_id), handle);
        Ok(())
    }

    fn put_many(&self, table: &str, handles: &[Handle]) -> Result<()> {
        let _guard = self.batch_lock.lock();
        for handle in handles {
            self.handles
                .insert((table.to_string(), handle.logical_id), *handle);
        }
        Ok(())
    }

    fn delete(&self, table: &str, id: LogicalId) -> Result<()> {
        self.handles.remove(&(table.to_string(), id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::ids::PhysicalId;

    fn sample(logical: LogicalId) -> Handle {
        Handle::new_added(logical, PhysicalId::new())
    }

    #[test]
    fn get_of_unknown_id_is_none() {
        let reg = MemRegistry::new();
        assert_eq!(reg.get("t", LogicalId::new()).unwrap(), None);
    }

    #[test]
    fn put_then_get_round_trips() {
        let reg = MemRegistry::new();
        let id = LogicalId::new();
        let h = sample(id);
        reg.put("t", h).unwrap();
        assert_eq!(reg.get("t", id).unwrap(), Some(h));
    }

    #[test]
    fn get_many_preserves_order_and_misses() {
        let reg = MemRegistry::new();
        let a = LogicalId::new();
        let b = LogicalId::new();
        let c = LogicalId::new();
        reg.put("t", sample(a)).unwrap();
        reg.put("t", sample(c)).unwrap();
        let got = reg.get_many("t", &[a, b, c]).unwrap();
        assert!(got[0].is_some());
        assert!(got[1].is_none());
        assert!(got[2].is_some());
    }

    #[test]
    fn put_many_applies_every_handle() {
        let reg = MemRegistry::new();
        let ids: Vec<LogicalId> = (0..5).map(|_| LogicalId::new()).collect();
        let handles: Vec<Handle> = ids.iter().map(|id| sample(*id)).collect();
        reg.put_many("t", &handles).unwrap();
        for id in &ids {
            assert!(reg.get("t", *id).unwrap().is_some());
        }
    }

    #[test]
    fn tables_are_isolated() {
        let reg = MemRegistry::new();
        let id = LogicalId::new();
        reg.put("a", sample(id)).unwrap();
        assert_eq!(reg.get("b", id).unwrap(), None);
    }

    #[test]
    fn delete_removes_handle() {
        let reg = MemRegistry::new();
        let id = LogicalId::new();
        reg.put("t", sample(id)).unwrap();
        reg.delete("t", id).unwrap();
        assert_eq!(reg.get("t", id).unwrap(), None);
    }
}
