//! Bounded in-memory cache for derived records
//!
//! A strict LRU keyed cache of [`CacheRecord`] entries. Capacity is a
//! hard bound on entry count: inserting into a full cache always evicts
//! the least recently used entry first. An optional TTL drops stale
//! entries at read time.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A cached value plus the instant it was stored
#[derive(Debug, Clone)]
pub struct CacheRecord<V> {
    /// The cached value
    pub value: V,
    /// When the value was inserted
    pub stored_at: Instant,
}

impl<V> CacheRecord<V> {
    fn new(value: V) -> Self {
        CacheRecord {
            value,
            stored_at: Instant::now(),
        }
    }

    /// Time elapsed since the record was stored
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// Whether the record is still within the given TTL
    pub fn is_fresh(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(limit) => self.age() <= limit,
            None => true,
        }
    }
}

/// Counters for cache effectiveness
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total lookups that returned a fresh value
    pub hits: u64,
    /// Total lookups that returned nothing
    pub misses: u64,
    /// Entries displaced by capacity pressure
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Current number of entries
    pub len: usize,
    /// Maximum number of entries
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, CacheRecord<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Strictly bounded LRU cache with optional TTL
pub struct MemoryCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<Inner<K, V>>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq, V: Clone> MemoryCache<K, V> {
    /// Create a cache holding at most `capacity` entries, without a TTL
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Create a cache holding at most `capacity` entries with a TTL
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self::build(capacity, Some(ttl))
    }

    /// Create a record cache sized by a loader configuration
    pub fn from_config(config: &crate::config::CapsidConfig) -> Self {
        Self::build(config.memory_cache_capacity, Some(config.record_ttl))
    }

    fn build(capacity: usize, ttl: Option<Duration>) -> Self {
        // A zero capacity would make every insert a no-op; clamp to one.
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            ttl,
        }
    }

    /// Fetch a fresh value, promoting it to most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(key)
            .map(|record| (record.value.clone(), record.is_fresh(self.ttl)));
        match found {
            Some((value, true)) => {
                inner.hits += 1;
                Some(value)
            }
            Some((_, false)) => {
                inner.entries.pop(key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting the least recently used entry when full
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let full = inner.entries.len() == inner.entries.cap().get();
        if full && !inner.entries.contains(&key) {
            inner.evictions += 1;
        }
        inner.entries.put(key, CacheRecord::new(value));
    }

    /// Whether a fresh value exists, without promoting it
    pub fn contains(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .map(|record| record.is_fresh(self.ttl))
            .unwrap_or(false)
    }

    /// Current number of entries, counting not-yet-swept expired ones
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }

    /// Drop every entry, keeping the counters
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Snapshot of the effectiveness counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            len: inner.entries.len(),
            capacity: inner.entries.cap().get(),
        }
    }
}
