//! C3: the shared, TTL-based L2 cache and distributed lock service.
//!
//! A real deployment backs this with something genuinely shared across
//! processes (Redis, memcached, an object bucket with conditional writes);
//! [`MemL2Cache`] is the in-process stand-in every other crate's tests run
//! against, but it implements the same double-read lock protocol any
//! backend must: set `(key -> lock_id)` with a TTL, then re-read `key`; if
//! the re-read value doesn't equal the caller's `lock_id`, the lock is lost
//! and must be released.

use crate::ttl::TtlIndex;
use parking_lot::Mutex;
use sop_core::error::Result;
use sop_core::time::now_micros;
use std::collections::HashMap;
use uuid::Uuid;

struct Entry {
    bytes: Vec<u8>,
    expiry_micros: i64,
}

/// In-memory L2 cache and lock service.
///
/// A single mutex guards both the value map and the TTL index; this is the
/// in-process analogue of a shared cache's own internal consistency — every
/// operation here is meant to be replaced by a network round-trip to a real
/// shared backend, not optimized for concurrent in-process throughput.
pub struct MemL2Cache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    ttl_index: TtlIndex,
}

impl Default for MemL2Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemL2Cache {
    /// An empty cache.
    pub fn new() -> Self {
        MemL2Cache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                ttl_index: TtlIndex::new(),
            }),
        }
    }

    fn set_locked(inner: &mut Inner, key: &str, bytes: Vec<u8>, ttl_seconds: u64) {
        let expiry = now_micros() + ttl_seconds as i64 * 1_000_000;
        if let Some(old) = inner.entries.get(key) {
            inner.ttl_index.remove(old.expiry_micros, key);
        }
        inner.ttl_index.insert(expiry, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                bytes,
                expiry_micros: expiry,
            },
        );
    }

    fn get_locked(inner: &mut Inner, key: &str) -> Option<Vec<u8>> {
        let now = now_micros();
        match inner.entries.get(key) {
            Some(e) if e.expiry_micros > now => Some(e.bytes.clone()),
            Some(_) => {
                // Lazily evict: expired but not yet swept.
                let e = inner.entries.remove(key).unwrap();
                inner.ttl_index.remove(e.expiry_micros, key);
                None
            }
            None => None,
        }
    }

    /// Evict every entry (and lock) whose TTL has elapsed. Call periodically
    /// from a background sweep; correctness does not depend on it (lazy
    /// expiry in `get` covers the rest), only memory growth does.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = now_micros();
        let expired = inner.ttl_index.find_expired(now);
        let count = expired.len();
        for key in expired {
            inner.entries.remove(&key);
        }
        inner.ttl_index.remove_expired(now);
        count
    }
}

impl sop_core::traits::L2Cache for MemL2Cache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Ok(Self::get_locked(&mut inner, key))
    }

    fn put(&self, key: &str, bytes: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::set_locked(&mut inner, key, bytes, ttl_seconds);
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.remove(key) {
            inner.ttl_index.remove(e.expiry_micros, key);
        }
        Ok(())
    }

    fn try_lock(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let lock_key = format!("lock:{key}");
        let my_token = Uuid::new_v4().as_bytes().to_vec();
        {
            let mut inner = self.inner.lock();
            // Someone else already holds a live lock on this key: don't
            // steal it by overwriting.
            if Self::get_locked(&mut inner, &lock_key).is_some() {
                return Ok(false);
            }
            // set, only now that the key was observed absent
            Self::set_locked(&mut inner, &lock_key, my_token.clone(), ttl_seconds);
        }
        // re-read: if someone else's set raced in between and won, we lose.
        let mut inner = self.inner.lock();
        let winner = Self::get_locked(&mut inner, &lock_key);
        Ok(winner.as_deref() == Some(my_token.as_slice()))
    }

    fn unlock(&self, key: &str) -> Result<()> {
        let lock_key = format!("lock:{key}");
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.remove(&lock_key) {
            inner.ttl_index.remove(e.expiry_micros, &lock_key);
        }
        Ok(())
    }
}
