//! C4: the per-process, bounded-capacity MRU cache.
//!
//! Coherent with L2 in the sense that every write path that updates L2
//! (a handle flip, a node write) also invalidates this cache's entry for the
//! same key — see `sop-concurrency`'s commit path. This cache itself only
//! implements the bounded-capacity, most-recently-used-stays eviction
//! policy; it has no TTL of its own and no cross-process visibility.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

struct Inner<K, V> {
    entries: HashMap<K, V>,
    // Back = most recently used. Linear scan on touch is acceptable at the
    // capacities this cache is sized for (hundreds to low thousands of hot
    // nodes/handles per process).
    order: VecDeque<K>,
    capacity: usize,
}

/// Bounded most-recently-used cache, generic over any hashable key.
///
/// Used by `sop-engine`/`sop-concurrency` as `MruCache<LogicalId, Handle>`
/// and `MruCache<PhysicalId, Node>`.
pub struct MruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> MruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A cache holding at most `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "MruCache capacity must be > 0");
        MruCache {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Fetch `key`, marking it most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.entries.get(key).cloned() {
            Self::touch(&mut inner, key);
            Some(v)
        } else {
            None
        }
    }

    /// Insert or update `key`, evicting the least-recently-used entry if
    /// the cache is at capacity and `key` is new.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let is_new = !inner.entries.contains_key(&key);
        inner.entries.insert(key.clone(), value);
        if is_new {
            if inner.entries.len() > inner.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
            inner.order.push_back(key);
        } else {
            Self::touch(&mut inner, &key);
        }
    }

    /// Remove `key`, if present.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn touch(inner: &mut Inner<K, V>, key: &K) {
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let k = inner.order.remove(pos).unwrap();
            inner.order.push_back(k);
        }
    }
}
