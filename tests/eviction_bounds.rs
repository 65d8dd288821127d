//! Cache bounds under sustained use: structure byte budgets, memory
//! cache capacity, and prefetch interaction with both.

mod common;

use async_trait::async_trait;
use capsid_rs::{MemoryCache, Prefetcher, RecordFetcher, SnapshotLoader, StructureFormat};
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_structure_budget_enforced_through_loader() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir).with_structure_budget_bytes(1000);
    let loader = SnapshotLoader::with_source(config, MockSource::serving(snapshot_bytes(30)))
        .unwrap();

    let structures = loader.structures();
    structures.put("1ABC", &vec![1u8; 400], StructureFormat::Cif).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    structures.put("2DEF", &vec![2u8; 400], StructureFormat::Bcif).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Touch the oldest entry so the middle one becomes the victim.
    structures.get("1ABC").unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    structures.put("3GHI", &vec![3u8; 400], StructureFormat::Cif).unwrap();

    // Writes hand trimming to the background; settle before asserting.
    structures.enforce_budget();

    assert!(structures.total_bytes() <= 1000);
    assert!(structures.contains("1ABC"));
    assert!(!structures.contains("2DEF"));
    assert!(structures.contains("3GHI"));
}

#[tokio::test]
async fn test_structures_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let body = b"data_1ABC\n_entry.id 1ABC\n".to_vec();

    {
        let loader = loader_over(&dir, MockSource::serving(snapshot_bytes(31)));
        loader
            .structures()
            .put("1ABC", &body, StructureFormat::Cif)
            .unwrap();
    }
    assert!(dir.path().join("structures").join("s_1ABC").exists());

    let loader = loader_over(&dir, MockSource::serving(snapshot_bytes(31)));
    let entry = loader.structures().get("1ABC").unwrap().unwrap();
    assert_eq!(entry.bytes, body);
    assert_eq!(entry.format, StructureFormat::Cif);
}

#[tokio::test]
async fn test_memory_cache_bound_holds_under_churn() {
    let cache: MemoryCache<u64, Vec<u8>> = MemoryCache::new(8);

    for i in 0..200u64 {
        cache.put(i, vec![0u8; 64]);
        if i % 3 == 0 {
            cache.get(&(i / 2));
        }
        assert!(cache.len() <= 8, "bound exceeded at insert {i}");
    }

    let stats = cache.stats();
    assert_eq!(stats.len, 8);
    assert_eq!(stats.capacity, 8);
    assert!(stats.evictions >= 192);
}

struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl RecordFetcher<String> for CountingFetcher {
    async fn fetch_record(&self, index: u64) -> capsid_rs::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("record-{index}"))
    }
}

#[tokio::test]
async fn test_prefetch_respects_cache_bound() {
    let cache = Arc::new(MemoryCache::new(5));
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
    });
    let prefetcher = Prefetcher::new(cache.clone(), fetcher.clone(), 100);

    let fetched = prefetcher.prefetch_around(50, 3).await;

    // Three rings of two records each around the focus.
    assert_eq!(fetched, 6);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    assert_eq!(cache.len(), 5);

    // The innermost ring was inserted first and paid for the eviction.
    assert!(cache.contains(&53));
    assert!(cache.contains(&47));
}

#[tokio::test]
async fn test_prefetch_skips_already_cached_records() {
    let cache = Arc::new(MemoryCache::new(64));
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
    });
    let prefetcher = Prefetcher::new(cache.clone(), fetcher.clone(), 100);

    cache.put(49, "warm".to_string());
    cache.put(51, "warm".to_string());
    let fetched = prefetcher.prefetch_around(50, 2).await;

    assert_eq!(fetched, 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&49).as_deref(), Some("warm"));
}
