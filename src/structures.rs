//! Durable cache for macromolecular structure files
//!
//! Structure files (mmCIF or BinaryCIF) are fetched by consumers and
//! parked here so revisiting a record does not re-download them. The
//! cache is budgeted by total bytes rather than entry count; when a
//! write pushes it over budget, the least recently accessed entries are
//! evicted in the background until it fits again. Eviction never blocks
//! the write path.
//!
//! Blobs live in a [`BlobStore`] directory next to a JSON index that
//! carries per-entry bookkeeping. On open the two are reconciled, so a
//! missing blob or a stray file never wedges the cache.

use crate::error::Result;
use crate::store::BlobStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store key of the JSON index
const INDEX_KEY: &str = "_index";

/// Encoding of a cached structure file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureFormat {
    /// Text mmCIF
    Cif,
    /// BinaryCIF
    Bcif,
}

impl StructureFormat {
    /// Stable lowercase name of the format
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureFormat::Cif => "cif",
            StructureFormat::Bcif => "bcif",
        }
    }
}

/// Per-entry bookkeeping persisted in the index
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StructureMeta {
    format: StructureFormat,
    fetched_at_ms: i64,
    last_accessed_ms: i64,
    size_bytes: u64,
}

/// A cached structure file with its bookkeeping
#[derive(Debug, Clone)]
pub struct StructureCacheEntry {
    /// Structure identifier, e.g. a PDB id
    pub id: String,
    /// File contents
    pub bytes: Vec<u8>,
    /// File encoding
    pub format: StructureFormat,
    /// Epoch millis when the entry was stored
    pub fetched_at_ms: i64,
    /// Epoch millis of the most recent access
    pub last_accessed_ms: i64,
    /// Size of `bytes`
    pub size_bytes: u64,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Default)]
pub struct StructureCacheStats {
    /// Number of cached structures
    pub entries: usize,
    /// Total cached bytes
    pub total_bytes: u64,
    /// Configured byte budget
    pub budget_bytes: u64,
}

struct StructureInner {
    store: BlobStore,
    index: Mutex<HashMap<String, StructureMeta>>,
    budget_bytes: u64,
}

/// Byte-budgeted durable structure cache
#[derive(Clone)]
pub struct StructureCache {
    inner: Arc<StructureInner>,
}

impl StructureCache {
    /// Open (or create) a cache rooted at `dir` with a byte budget
    pub fn open(dir: impl AsRef<Path>, budget_bytes: u64) -> Result<Self> {
        let store = BlobStore::open(dir)?;
        let mut index: HashMap<String, StructureMeta> = match store.get(INDEX_KEY)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    warn!(error = %e, "structure index unreadable; rebuilding empty");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        // Reconcile the index with what is actually on disk.
        let on_disk = store.keys()?;
        let mut dirty = false;
        index.retain(|id, _| {
            let present = on_disk.contains(&crate::store::sanitize_key(&blob_key(id)));
            if !present {
                warn!(id = %id.as_str(), "structure blob missing; dropping index entry");
                dirty = true;
            }
            present
        });
        let indexed: Vec<String> = index.keys().map(|id| blob_key(id)).collect();
        for key in on_disk {
            if key == INDEX_KEY
                || indexed
                    .iter()
                    .any(|k| crate::store::sanitize_key(k) == key)
            {
                continue;
            }
            debug!(file = %key.as_str(), "removing orphaned structure blob");
            let _ = store.delete(&key);
        }

        let cache = StructureCache {
            inner: Arc::new(StructureInner {
                store,
                index: Mutex::new(index),
                budget_bytes,
            }),
        };
        if dirty {
            cache.flush_index();
        }
        Ok(cache)
    }

    /// Fetch a cached structure, refreshing its access stamp
    pub fn get(&self, id: &str) -> Result<Option<StructureCacheEntry>> {
        let meta = match self.inner.index.lock().get(id).cloned() {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let bytes = match self.inner.store.get(&blob_key(id))? {
            Some(bytes) => bytes,
            None => {
                // Blob vanished underneath us; heal the index.
                warn!(id, "structure blob missing; dropping index entry");
                self.inner.index.lock().remove(id);
                self.flush_index();
                return Ok(None);
            }
        };

        let now = epoch_ms();
        let fetched_at_ms = meta.fetched_at_ms;
        if let Some(live) = self.inner.index.lock().get_mut(id) {
            live.last_accessed_ms = now;
        }
        self.flush_index();

        Ok(Some(StructureCacheEntry {
            id: id.to_string(),
            size_bytes: bytes.len() as u64,
            bytes,
            format: meta.format,
            fetched_at_ms,
            last_accessed_ms: now,
        }))
    }

    /// Store a structure, then trim the cache to budget in the background
    pub fn put(&self, id: &str, bytes: &[u8], format: StructureFormat) -> Result<()> {
        self.inner.store.put(&blob_key(id), bytes)?;

        let now = epoch_ms();
        self.inner.index.lock().insert(
            id.to_string(),
            StructureMeta {
                format,
                fetched_at_ms: now,
                last_accessed_ms: now,
                size_bytes: bytes.len() as u64,
            },
        );
        self.flush_index();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                handle.spawn_blocking(move || cache.enforce_budget());
            }
            // Without a runtime there is nothing to defer to.
            Err(_) => self.enforce_budget(),
        }
        Ok(())
    }

    /// Remove one structure from the cache
    pub fn remove(&self, id: &str) -> Result<()> {
        self.inner.store.delete(&blob_key(id))?;
        if self.inner.index.lock().remove(id).is_some() {
            self.flush_index();
        }
        Ok(())
    }

    /// Whether a structure is cached
    pub fn contains(&self, id: &str) -> bool {
        self.inner.index.lock().contains_key(id)
    }

    /// Total bytes across cached structures
    pub fn total_bytes(&self) -> u64 {
        self.inner
            .index
            .lock()
            .values()
            .map(|m| m.size_bytes)
            .sum()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> StructureCacheStats {
        let index = self.inner.index.lock();
        StructureCacheStats {
            entries: index.len(),
            total_bytes: index.values().map(|m| m.size_bytes).sum(),
            budget_bytes: self.inner.budget_bytes,
        }
    }

    /// Evict least recently accessed entries until the cache fits its budget
    ///
    /// Runs in the background after writes; also callable directly.
    pub fn enforce_budget(&self) {
        let victims: Vec<String> = {
            let index = self.inner.index.lock();
            let mut total: u64 = index.values().map(|m| m.size_bytes).sum();
            if total <= self.inner.budget_bytes {
                return;
            }
            let mut by_age: Vec<(String, i64, u64)> = index
                .iter()
                .map(|(id, m)| (id.clone(), m.last_accessed_ms, m.size_bytes))
                .collect();
            by_age.sort_by_key(|(_, accessed, _)| *accessed);

            let mut victims = Vec::new();
            for (id, _, size) in by_age {
                if total <= self.inner.budget_bytes {
                    break;
                }
                total -= size;
                victims.push(id);
            }
            victims
        };

        for id in &victims {
            if let Err(e) = self.inner.store.delete(&blob_key(id)) {
                warn!(id = %id.as_str(), error = %e, "failed to evict structure blob");
            }
        }
        {
            let mut index = self.inner.index.lock();
            for id in &victims {
                index.remove(id);
            }
        }
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "structure cache trimmed to budget");
            self.flush_index();
        }
    }

    fn flush_index(&self) {
        let body = {
            let index = self.inner.index.lock();
            serde_json::to_vec(&*index)
        };
        let result = match body {
            Ok(body) => self.inner.store.put(INDEX_KEY, &body),
            Err(e) => {
                warn!(error = %e, "structure index serialization failed");
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist structure index");
        }
    }
}

fn blob_key(id: &str) -> String {
    format!("s:{id}")
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn blob(size: usize, fill: u8) -> Vec<u8> {
        vec![fill; size]
    }

    #[test]
    fn test_put_get_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 1024)?;

        cache.put("1ABC", &blob(40, 1), StructureFormat::Cif)?;
        let entry = cache.get("1ABC")?.unwrap();
        assert_eq!(entry.id, "1ABC");
        assert_eq!(entry.bytes, blob(40, 1));
        assert_eq!(entry.format, StructureFormat::Cif);
        assert_eq!(entry.size_bytes, 40);
        assert!(entry.fetched_at_ms > 0);

        assert!(cache.get("9ZZZ")?.is_none());
        Ok(())
    }

    #[test]
    fn test_access_refreshes_stamp() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 1024)?;

        cache.put("OLD", &blob(10, 1), StructureFormat::Cif)?;
        sleep(Duration::from_millis(15));
        let first = cache.get("OLD")?.unwrap();
        sleep(Duration::from_millis(15));
        let second = cache.get("OLD")?.unwrap();
        assert!(second.last_accessed_ms > first.last_accessed_ms);
        assert_eq!(second.fetched_at_ms, first.fetched_at_ms);
        Ok(())
    }

    #[test]
    fn test_budget_evicts_least_recently_accessed() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 100)?;

        cache.put("A", &blob(40, 1), StructureFormat::Cif)?;
        sleep(Duration::from_millis(10));
        cache.put("B", &blob(40, 2), StructureFormat::Bcif)?;
        sleep(Duration::from_millis(10));

        // Touch A so B is the oldest access.
        cache.get("A")?;
        sleep(Duration::from_millis(10));

        cache.put("C", &blob(40, 3), StructureFormat::Cif)?;
        cache.enforce_budget();

        assert!(cache.total_bytes() <= 100);
        assert!(!cache.contains("B"));
        assert!(cache.contains("A"));
        assert!(cache.contains("C"));
        Ok(())
    }

    #[test]
    fn test_eviction_repeats_until_within_budget() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 50)?;

        for (i, id) in ["A", "B", "C", "D"].iter().enumerate() {
            cache.put(id, &blob(40, i as u8), StructureFormat::Cif)?;
            sleep(Duration::from_millis(5));
        }
        cache.enforce_budget();

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 40);
        assert!(cache.contains("D"));
        Ok(())
    }

    #[test]
    fn test_reopen_preserves_entries() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let cache = StructureCache::open(dir.path(), 1024)?;
            cache.put("KEEP", &blob(25, 7), StructureFormat::Bcif)?;
        }
        let cache = StructureCache::open(dir.path(), 1024)?;
        let entry = cache.get("KEEP")?.unwrap();
        assert_eq!(entry.format, StructureFormat::Bcif);
        assert_eq!(entry.size_bytes, 25);
        Ok(())
    }

    #[test]
    fn test_missing_blob_heals_index() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 1024)?;
        cache.put("GONE", &blob(10, 1), StructureFormat::Cif)?;

        // Delete the blob behind the cache's back.
        std::fs::remove_file(
            dir.path()
                .join(crate::store::sanitize_key(&blob_key("GONE"))),
        )
        .unwrap();

        assert!(cache.get("GONE")?.is_none());
        assert!(!cache.contains("GONE"));
        Ok(())
    }

    #[test]
    fn test_reopen_drops_dangling_index_entries() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let cache = StructureCache::open(dir.path(), 1024)?;
            cache.put("DANGLING", &blob(10, 1), StructureFormat::Cif)?;
        }
        std::fs::remove_file(
            dir.path()
                .join(crate::store::sanitize_key(&blob_key("DANGLING"))),
        )
        .unwrap();

        let cache = StructureCache::open(dir.path(), 1024)?;
        assert!(!cache.contains("DANGLING"));
        assert_eq!(cache.stats().entries, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_trims_in_background() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = StructureCache::open(dir.path(), 50)?;

        cache.put("A", &blob(40, 1), StructureFormat::Cif)?;
        cache.put("B", &blob(40, 2), StructureFormat::Cif)?;

        // The write itself never blocks on eviction; give the spawned
        // trim a moment, then settle deterministically.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.enforce_budget();
        assert!(cache.total_bytes() <= 50);
        Ok(())
    }
}
