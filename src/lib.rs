//! # Capsid - Verified Snapshot Acquisition and Tiered Caching
//!
//! `capsid-rs` acquires packaged SQLite genome snapshots over HTTP and
//! serves them through a tiered cache, so browsers of large phage
//! datasets start fast and keep working offline:
//!
//! - **Verified downloads** with format sniffing and SHA-256 digests
//! - **Durable caching** with atomic writes and corruption self-healing
//! - **Stale-while-revalidate**: cached copies serve immediately while a
//!   background refresh checks the published manifest
//! - **Bounded caches** for query records and structure files, with LRU
//!   and byte-budget eviction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capsid_rs::{CapsidConfig, SnapshotLoader};
//!
//! # #[tokio::main]
//! # async fn main() -> capsid_rs::Result<()> {
//! let config = CapsidConfig::new(
//!     "phage-db",
//!     "https://example.org/data/phage-db.sqlite",
//!     "https://example.org/data/manifest.json",
//!     "/var/cache/capsid",
//! );
//! let loader = SnapshotLoader::new(config)?;
//!
//! // Served from the durable cache when a verified copy exists,
//! // downloaded and persisted otherwise.
//! let dataset = loader.load().await?;
//!
//! let conn = dataset.open_readonly()?;
//! let count: i64 = conn.query_row("SELECT COUNT(*) FROM genes", [], |r| r.get(0))?;
//! println!("{} genes in snapshot {}", count, dataset.content_hash());
//! # Ok(())
//! # }
//! ```
//!
//! ## Progress Reporting
//!
//! ```rust,no_run
//! use capsid_rs::{CapsidConfig, ProgressSender, SnapshotLoader};
//!
//! # #[tokio::main]
//! # async fn main() -> capsid_rs::Result<()> {
//! # let config = CapsidConfig::new("phage-db", "http://x/db", "http://x/m", "/tmp/capsid");
//! let loader = SnapshotLoader::new(config)?;
//! let (tx, mut rx) = ProgressSender::channel();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{} {}% {}", event.stage.as_str(), event.percent, event.message);
//!     }
//! });
//!
//! let dataset = loader.load_with_progress(tx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dataset;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod integrity;
pub mod loader;
pub mod manifest;
pub mod memcache;
pub mod prefetch;
pub mod progress;
pub mod source;
pub mod store;
pub mod structures;

pub use crate::config::CapsidConfig;
pub use crate::dataset::Dataset;
pub use crate::decompress::{DecodeStrategy, DecompressPipeline};
pub use crate::error::{CapsidError, Result};
pub use crate::fetch::HttpSource;
pub use crate::integrity::SNAPSHOT_MAGIC;
pub use crate::loader::SnapshotLoader;
pub use crate::manifest::{ManifestFetch, SnapshotManifest};
pub use crate::memcache::{CacheRecord, CacheStats, MemoryCache};
pub use crate::prefetch::{Prefetcher, RecordFetcher};
pub use crate::progress::{LoadProgress, LoadStage, ProgressSender};
pub use crate::source::Source;
pub use crate::store::BlobStore;
pub use crate::structures::{
    StructureCache, StructureCacheEntry, StructureCacheStats, StructureFormat,
};
