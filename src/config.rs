//! Loader configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default capacity of the in-memory record cache
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 100;

/// Default time-to-live for cached record metadata
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(10 * 60);

/// Default byte budget for the durable structure cache (100 MiB)
pub const DEFAULT_STRUCTURE_BUDGET_BYTES: u64 = 100 * 1024 * 1024;

/// Default per-request fetch timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`SnapshotLoader`](crate::loader::SnapshotLoader)
///
/// Each configuration describes exactly one logical dataset: where its
/// snapshot and manifest live on the network and where cached copies go
/// on disk.
///
/// # Examples
///
/// ```rust
/// use capsid_rs::CapsidConfig;
/// use std::time::Duration;
///
/// let config = CapsidConfig::new(
///     "phage-db",
///     "https://cdn.example.org/phage-db.sqlite",
///     "https://cdn.example.org/phage-db.manifest.json",
///     "/var/cache/capsid",
/// )
/// .with_memory_cache_capacity(200)
/// .with_fetch_timeout(Some(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone)]
pub struct CapsidConfig {
    /// Logical dataset name, used as the durable store key prefix
    pub dataset_name: String,
    /// URL of the uncompressed snapshot; the gzip variant is `{url}.gz`
    pub dataset_url: String,
    /// URL of the version manifest
    pub manifest_url: String,
    /// Directory holding all durable cache state
    pub cache_dir: PathBuf,
    /// Maximum number of entries in the in-memory record cache
    pub memory_cache_capacity: usize,
    /// Time-to-live for in-memory record entries
    pub record_ttl: Duration,
    /// Byte budget for the durable structure cache
    pub structure_budget_bytes: u64,
    /// Per-request timeout for snapshot and manifest fetches; `None` disables it
    pub fetch_timeout: Option<Duration>,
    /// Soft byte quota for the durable snapshot store; `None` means unlimited
    pub store_quota_bytes: Option<u64>,
}

impl CapsidConfig {
    /// Create a configuration with default cache sizing
    pub fn new(
        dataset_name: impl Into<String>,
        dataset_url: impl Into<String>,
        manifest_url: impl Into<String>,
        cache_dir: impl AsRef<Path>,
    ) -> Self {
        CapsidConfig {
            dataset_name: dataset_name.into(),
            dataset_url: dataset_url.into(),
            manifest_url: manifest_url.into(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
            memory_cache_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
            record_ttl: DEFAULT_RECORD_TTL,
            structure_budget_bytes: DEFAULT_STRUCTURE_BUDGET_BYTES,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            store_quota_bytes: None,
        }
    }

    /// Set the in-memory record cache capacity (entries)
    pub fn with_memory_cache_capacity(mut self, capacity: usize) -> Self {
        self.memory_cache_capacity = capacity;
        self
    }

    /// Set the time-to-live for in-memory record entries
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Set the byte budget for the durable structure cache
    pub fn with_structure_budget_bytes(mut self, budget: u64) -> Self {
        self.structure_budget_bytes = budget;
        self
    }

    /// Set or disable the per-request fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set a soft byte quota on the durable snapshot store
    pub fn with_store_quota_bytes(mut self, quota: u64) -> Self {
        self.store_quota_bytes = Some(quota);
        self
    }
}
