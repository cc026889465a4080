//! # Per-Worker Entity Cache
//!
//! LRU cache of decrypted entities, keyed by entity id. Each entry carries
//! the storage `version` it was loaded at so the data path can revalidate
//! cheaply against the metadata sidecar. Entries past the configured TTL
//! are treated as misses and dropped on access.
//!
//! Plaintext lives only in this process; the cache is cleared on shutdown.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entities held.
    pub capacity: usize,
    /// Entry lifetime; zero disables expiry.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::ZERO,
        }
    }
}

/// A cached decrypted entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Serialized JSON document.
    pub plaintext: Vec<u8>,
    /// Storage version the plaintext was loaded at.
    pub version: u64,
}

struct TimedEntry {
    entry: CacheEntry,
    stored_at: Instant,
}

/// Thread-safe LRU of `entity_id → (plaintext, version)`.
pub struct EntityCache {
    inner: Mutex<LruCache<String, TimedEntry>>,
    ttl: Duration,
}

impl EntityCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
        }
    }

    /// Look up an entity, refreshing its recency. Expired entries are
    /// removed and reported as misses.
    pub fn get(&self, entity_id: &str) -> Option<CacheEntry> {
        let mut cache = self.inner.lock();
        let expired = match cache.get(entity_id) {
            Some(timed) => {
                if !self.ttl.is_zero() && timed.stored_at.elapsed() > self.ttl {
                    true
                } else {
                    return Some(timed.entry.clone());
                }
            }
            None => return None,
        };
        if expired {
            cache.pop(entity_id);
        }
        None
    }

    /// Insert or overwrite an entity, evicting the least recently used
    /// entry when full.
    pub fn set(&self, entity_id: &str, entry: CacheEntry) {
        let mut cache = self.inner.lock();
        cache.put(
            entity_id.to_string(),
            TimedEntry {
                entry,
                stored_at: Instant::now(),
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries; called on shutdown so plaintext does not outlive
    /// the serving process.
    pub fn close(&self) {
        self.inner.lock().clear();
    }
}
