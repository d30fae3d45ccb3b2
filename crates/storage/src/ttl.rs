//! Expiry index shared by the L2 cache's TTL sweep.
//!
//! Maps expiry timestamp (microseconds) to the set of cache keys expiring
//! then, so a sweep finds everything due for eviction without scanning the
//! whole cache.

use std::collections::{BTreeMap, HashSet};

/// Expiry-timestamp -> keys index.
#[derive(Debug, Default)]
pub struct TtlIndex {
    index: BTreeMap<i64, HashSet<String>>,
}

impl TtlIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` expires at `expiry_micros`.
    pub fn insert(&mut self, expiry_micros: i64, key: String) {
        self.index.entry(expiry_micros).or_default().insert(key);
    }

    /// Remove `key`'s entry at `expiry_micros` (used when a key is
    /// overwritten with a new TTL or explicitly invalidated).
    pub fn remove(&mut self, expiry_micros: i64, key: &str) {
        if let Some(keys) = self.index.get_mut(&expiry_micros) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&expiry_micros);
            }
        }
    }

    /// Keys whose expiry is at or before `now_micros`.
    pub fn find_expired(&self, now_micros: i64) -> Vec<String> {
        self.index
            .range(..=now_micros)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Drop every index entry at or before `now_micros`, returning how many
    /// keys were dropped.
    pub fn remove_expired(&mut self, now_micros: i64) -> usize {
        let expired: Vec<i64> = self.index.range(..=now_micros).map(|(ts, _)| *ts).collect();
        let mut count = 0;
        for ts in expired {
            if let Some(keys) = self.index.remove(&ts) {
                count += keys.len();
            }
        }
        count
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_expired_only_returns_due_keys() {
        let mut idx = TtlIndex::new();
        idx.insert(500, "a".into());
        idx.insert(800, "b".into());
        idx.insert(1200, "c".into());

        let expired = idx.find_expired(1000);
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&"a".to_string()));
        assert!(expired.contains(&"b".to_string()));
    }

    #[test]
    fn remove_drops_timestamp_bucket_once_empty() {
        let mut idx = TtlIndex::new();
        idx.insert(500, "a".into());
        idx.insert(500, "b".into());
        idx.remove(500, "a");
        assert!(!idx.is_empty());
        idx.remove(500, "b");
        assert!(idx.is_empty());
    }

    #[test]
    fn remove_expired_clears_due_buckets_only() {
        let mut idx = TtlIndex::new();
        idx.insert(500, "a".into());
        idx.insert(1500, "b".into());
        let removed = idx.remove_expired(1000);
        assert_eq!(removed, 1);
        assert_eq!(idx.find_expired(2000), vec!["b".to_string()]);
    }
}
