//! Read-through cache keyed by `(key, version)`.
//!
//! Each key holds at most one entry. A lookup with a version other than the
//! stored one misses, so a writer that bumps the version invalidates readers
//! without coordination. Writers may also evict explicitly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct CacheEntry<V> {
    version: u64,
    value: Arc<V>,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct VersionedCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> VersionedCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K, version: u64) -> Option<Arc<V>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.version == version => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.value))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` for `version`. An older version never replaces a newer one.
    pub fn insert(&self, key: K, version: u64, value: V) -> Arc<V> {
        self.insert_shared(key, version, Arc::new(value))
    }

    /// Like [`insert`](Self::insert) for a value that is already shared.
    pub fn insert_shared(&self, key: K, version: u64, value: Arc<V>) -> Arc<V> {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) if existing.version > version => {}
            _ => {
                entries.insert(
                    key,
                    CacheEntry {
                        version,
                        value: Arc::clone(&value),
                    },
                );
            }
        }
        value
    }

    pub fn evict(&self, key: &K) {
        self.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }
}

impl<K, V> Default for VersionedCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
