//! Neighborhood prefetch around the record in focus
//!
//! When a browsing session lands on a record, its neighbors are the
//! likeliest next stops. The prefetcher warms the in-memory record
//! cache in expanding rings around the focused index: both immediate
//! neighbors first, then distance two, and so on. A ring's fetches run
//! concurrently, but each ring completes before the next begins, so the
//! closest records always win network capacity.

use crate::error::Result;
use crate::memcache::MemoryCache;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace};

/// Fetches one record's metadata by dense index
#[async_trait]
pub trait RecordFetcher<V>: Send + Sync {
    async fn fetch_record(&self, index: u64) -> Result<V>;
}

/// Ring-by-ring cache warmer
pub struct Prefetcher<V: Clone + Send + Sync + 'static> {
    cache: Arc<MemoryCache<u64, V>>,
    fetcher: Arc<dyn RecordFetcher<V>>,
    record_count: u64,
}

impl<V: Clone + Send + Sync + 'static> Clone for Prefetcher<V> {
    fn clone(&self) -> Self {
        Prefetcher {
            cache: self.cache.clone(),
            fetcher: self.fetcher.clone(),
            record_count: self.record_count,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Prefetcher<V> {
    /// Create a prefetcher over a dataset with `record_count` records
    pub fn new(
        cache: Arc<MemoryCache<u64, V>>,
        fetcher: Arc<dyn RecordFetcher<V>>,
        record_count: u64,
    ) -> Self {
        Prefetcher {
            cache,
            fetcher,
            record_count,
        }
    }

    /// Warm the cache in expanding rings around `focus`
    ///
    /// Indices outside the dataset and records already cached are
    /// skipped. Individual fetch failures are logged and skipped; they
    /// never abort the remaining rings. Returns the number of records
    /// actually fetched.
    pub async fn prefetch_around(&self, focus: u64, radius: u64) -> usize {
        let mut fetched = 0;
        for distance in 1..=radius {
            let ring = self.ring_indices(focus, distance);
            if ring.is_empty() {
                continue;
            }
            trace!(focus, distance, count = ring.len(), "prefetching ring");

            let fetches = ring.into_iter().map(|index| {
                let fetcher = self.fetcher.clone();
                let cache = self.cache.clone();
                async move {
                    match fetcher.fetch_record(index).await {
                        Ok(value) => {
                            cache.put(index, value);
                            true
                        }
                        Err(e) => {
                            debug!(index, error = %e, "prefetch failed; skipping record");
                            false
                        }
                    }
                }
            });
            // The whole ring settles before the next one starts.
            fetched += join_all(fetches).await.into_iter().filter(|ok| *ok).count();
        }
        fetched
    }

    /// Fire-and-forget warming on a detached task
    pub fn prefetch_detached(&self, focus: u64, radius: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let fetched = this.prefetch_around(focus, radius).await;
            trace!(focus, fetched, "detached prefetch complete");
        });
    }

    fn ring_indices(&self, focus: u64, distance: u64) -> Vec<u64> {
        let mut ring = Vec::with_capacity(2);
        if let Some(below) = focus.checked_sub(distance) {
            if below < self.record_count && !self.cache.contains(&below) {
                ring.push(below);
            }
        }
        if let Some(above) = focus.checked_add(distance) {
            if above < self.record_count && !self.cache.contains(&above) {
                ring.push(above);
            }
        }
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapsidError;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Records fetch order; optionally fails or delays specific indices
    struct RecordingFetcher {
        order: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
        delay_on: Option<u64>,
    }

    impl RecordingFetcher {
        fn new() -> Self {
            RecordingFetcher {
                order: Mutex::new(Vec::new()),
                fail_on: None,
                delay_on: None,
            }
        }

        fn order(&self) -> Vec<u64> {
            self.order.lock().clone()
        }
    }

    #[async_trait]
    impl RecordFetcher<String> for RecordingFetcher {
        async fn fetch_record(&self, index: u64) -> Result<String> {
            if self.delay_on == Some(index) {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.order.lock().push(index);
            if self.fail_on == Some(index) {
                return Err(CapsidError::Network("simulated fetch failure".to_string()));
            }
            Ok(format!("gene-{index}"))
        }
    }

    fn prefetcher(
        fetcher: Arc<RecordingFetcher>,
        record_count: u64,
    ) -> (Prefetcher<String>, Arc<MemoryCache<u64, String>>) {
        let cache = Arc::new(MemoryCache::new(64));
        (
            Prefetcher::new(cache.clone(), fetcher, record_count),
            cache,
        )
    }

    fn as_set(slice: &[u64]) -> HashSet<u64> {
        slice.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_rings_expand_outward() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, cache) = prefetcher(fetcher.clone(), 100);

        let fetched = prefetcher.prefetch_around(10, 3).await;
        assert_eq!(fetched, 6);

        let order = fetcher.order();
        assert_eq!(as_set(&order[0..2]), as_set(&[9, 11]));
        assert_eq!(as_set(&order[2..4]), as_set(&[8, 12]));
        assert_eq!(as_set(&order[4..6]), as_set(&[7, 13]));

        assert_eq!(cache.get(&9).as_deref(), Some("gene-9"));
        assert_eq!(cache.get(&13).as_deref(), Some("gene-13"));
    }

    #[tokio::test]
    async fn test_ring_settles_before_next_starts() {
        let fetcher = Arc::new(RecordingFetcher {
            order: Mutex::new(Vec::new()),
            fail_on: None,
            delay_on: Some(11),
        });
        let (prefetcher, _) = prefetcher(fetcher.clone(), 100);

        prefetcher.prefetch_around(10, 2).await;

        // Even with 11 delayed, the outer ring only starts after it lands.
        let order = fetcher.order();
        assert_eq!(as_set(&order[0..2]), as_set(&[9, 11]));
        assert_eq!(as_set(&order[2..4]), as_set(&[8, 12]));
    }

    #[tokio::test]
    async fn test_clips_at_dataset_edges() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, _) = prefetcher(fetcher.clone(), 3);

        let fetched = prefetcher.prefetch_around(0, 2).await;
        assert_eq!(fetched, 2);
        assert_eq!(fetcher.order(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_focus_outside_dataset_fetches_nothing() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, _) = prefetcher(fetcher.clone(), 5);

        let fetched = prefetcher.prefetch_around(10, 1).await;
        assert_eq!(fetched, 0);
        assert!(fetcher.order().is_empty());
    }

    #[tokio::test]
    async fn test_cached_records_are_skipped() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, cache) = prefetcher(fetcher.clone(), 100);

        cache.put(9, "already here".to_string());
        let fetched = prefetcher.prefetch_around(10, 1).await;

        assert_eq!(fetched, 1);
        assert_eq!(fetcher.order(), vec![11]);
        assert_eq!(cache.get(&9).as_deref(), Some("already here"));
    }

    #[tokio::test]
    async fn test_failures_skip_without_aborting() {
        let fetcher = Arc::new(RecordingFetcher {
            order: Mutex::new(Vec::new()),
            fail_on: Some(11),
            delay_on: None,
        });
        let (prefetcher, cache) = prefetcher(fetcher.clone(), 100);

        let fetched = prefetcher.prefetch_around(10, 2).await;
        assert_eq!(fetched, 3);
        assert!(cache.get(&11).is_none());
        assert_eq!(cache.get(&12).as_deref(), Some("gene-12"));
    }

    #[tokio::test]
    async fn test_zero_radius_is_a_no_op() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, _) = prefetcher(fetcher.clone(), 100);

        assert_eq!(prefetcher.prefetch_around(10, 0).await, 0);
        assert!(fetcher.order().is_empty());
    }

    #[tokio::test]
    async fn test_detached_prefetch_warms_cache() {
        let fetcher = Arc::new(RecordingFetcher::new());
        let (prefetcher, cache) = prefetcher(fetcher.clone(), 100);

        prefetcher.prefetch_detached(10, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get(&9).as_deref(), Some("gene-9"));
        assert_eq!(cache.get(&11).as_deref(), Some("gene-11"));
    }
}
