//! Snapshot load orchestration
//!
//! [`SnapshotLoader`] drives a load from "is there a cached copy?"
//! through download, decode, verification and optional persistence,
//! emitting ordered progress along the way:
//!
//! ```text
//! Checking -> (cache hit) -> Ready
//!          -> (cache miss) -> Downloading -> Decompressing
//!                          -> Initializing -> Ready
//! ```
//!
//! Loads are single-flight: concurrent callers coalesce onto one
//! acquisition and share its result. Cache hits are served immediately
//! and revalidated against the manifest in the background; a corrupted
//! cached copy is purged and silently re-downloaded. Persistence is
//! best-effort: when the durable store is out of quota, the session
//! continues network-only.

use crate::config::CapsidConfig;
use crate::dataset::Dataset;
use crate::decompress::DecompressPipeline;
use crate::error::{CapsidError, Result};
use crate::fetch::HttpSource;
use crate::integrity::{digest_hex, integrity_error, is_valid_snapshot, verify_digest};
use crate::manifest::ManifestClient;
use crate::progress::{download_percent, LoadStage, ProgressSender};
use crate::source::Source;
use crate::store::BlobStore;
use crate::structures::StructureCache;
use futures::FutureExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Subdirectory of the cache dir holding snapshot blobs
const SNAPSHOT_DIR: &str = "snapshot";

/// Subdirectory of the cache dir holding structure blobs
const STRUCTURES_DIR: &str = "structures";

fn data_key(name: &str) -> String {
    format!("{name}:data")
}

fn hash_key(name: &str) -> String {
    format!("{name}:hash")
}

struct LoaderInner {
    config: CapsidConfig,
    source: Arc<dyn Source>,
    store: Arc<BlobStore>,
    structures: StructureCache,
    manifest_client: ManifestClient,
    pipeline: DecompressPipeline,
    current: Mutex<Option<Dataset>>,
    /// Single-flight gate; one acquisition per dataset at a time
    gate: AsyncMutex<()>,
    refresh_in_flight: AtomicBool,
    persist_disabled: AtomicBool,
    closed: AtomicBool,
}

/// Orchestrates verified snapshot acquisition for one dataset
#[derive(Clone)]
pub struct SnapshotLoader {
    inner: Arc<LoaderInner>,
}

impl SnapshotLoader {
    /// Create a loader that fetches over HTTP
    pub fn new(config: CapsidConfig) -> Result<Self> {
        let source = Arc::new(HttpSource::from_config(&config)?);
        Self::with_source(config, source)
    }

    /// Create a loader over a custom [`Source`]
    pub fn with_source(config: CapsidConfig, source: Arc<dyn Source>) -> Result<Self> {
        let store = match config.store_quota_bytes {
            Some(quota) => BlobStore::with_quota(config.cache_dir.join(SNAPSHOT_DIR), quota)?,
            None => BlobStore::open(config.cache_dir.join(SNAPSHOT_DIR))?,
        };
        let store = Arc::new(store);
        let structures = StructureCache::open(
            config.cache_dir.join(STRUCTURES_DIR),
            config.structure_budget_bytes,
        )?;
        let manifest_client =
            ManifestClient::new(source.clone(), store.clone(), &config.dataset_name);

        Ok(SnapshotLoader {
            inner: Arc::new(LoaderInner {
                config,
                source,
                store,
                structures,
                manifest_client,
                pipeline: DecompressPipeline::new(),
                current: Mutex::new(None),
                gate: AsyncMutex::new(()),
                refresh_in_flight: AtomicBool::new(false),
                persist_disabled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Load the dataset without progress reporting
    pub async fn load(&self) -> Result<Dataset> {
        self.load_with_progress(ProgressSender::disabled()).await
    }

    /// Load the dataset, emitting ordered progress events
    ///
    /// Returns the already-loaded dataset immediately when one is held;
    /// otherwise serves the durable cache when it verifies, and
    /// downloads when it does not. Concurrent callers coalesce onto a
    /// single acquisition.
    pub async fn load_with_progress(&self, progress: ProgressSender) -> Result<Dataset> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CapsidError::Closed);
        }

        let _flight = self.inner.gate.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CapsidError::Closed);
        }

        // A finished acquisition (ours or a coalesced caller's) wins.
        if let Some(dataset) = self.inner.current.lock().clone() {
            progress.emit(
                LoadStage::Ready,
                100,
                "snapshot ready",
                dataset.served_from_cache(),
            );
            return Ok(dataset);
        }

        progress.emit(LoadStage::Checking, 0, "checking local cache", false);

        if let Some(dataset) = self.read_persisted().await {
            *self.inner.current.lock() = Some(dataset.clone());
            self.spawn_revalidate();
            // The last persisted manifest is consulted synchronously; the
            // network manifest only feeds the background refresh.
            let update_available = self
                .inner
                .manifest_client
                .cached_manifest()
                .is_some_and(|m| m.content_hash != dataset.content_hash());
            let message = if update_available {
                "serving cached snapshot; update available"
            } else {
                "serving cached snapshot"
            };
            progress.emit(LoadStage::Ready, 100, message, true);
            return Ok(dataset);
        }

        let result = self.download_and_install(&progress).await;
        if let Err(e) = &result {
            progress.emit(LoadStage::Error, 100, e.to_string(), false);
        }
        result
    }

    /// The dataset from the last successful load, if any
    pub fn current(&self) -> Option<Dataset> {
        self.inner.current.lock().clone()
    }

    /// The durable structure cache sharing this loader's cache dir
    pub fn structures(&self) -> &StructureCache {
        &self.inner.structures
    }

    /// This loader's configuration
    pub fn config(&self) -> &CapsidConfig {
        &self.inner.config
    }

    /// Drop the persisted snapshot, manifest and etag for this dataset
    pub async fn clear_cached(&self) -> Result<()> {
        let _flight = self.inner.gate.lock().await;
        let name = &self.inner.config.dataset_name;
        self.inner.store.delete(&data_key(name))?;
        self.inner.store.delete(&hash_key(name))?;
        self.inner.store.delete(&format!("{name}:manifest"))?;
        self.inner.store.delete(&format!("{name}:etag"))?;
        *self.inner.current.lock() = None;
        info!(dataset = %name.as_str(), "cleared cached snapshot");
        Ok(())
    }

    /// Close the loader
    ///
    /// Pending worker jobs are rejected and in-flight loads return
    /// [`CapsidError::Closed`] instead of installing their result.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.current.lock() = None;
        self.inner.pipeline.close();
        debug!(dataset = %self.inner.config.dataset_name.as_str(), "loader closed");
    }

    /// Read and verify the persisted copy, purging it when it fails
    ///
    /// The file read and digest check run on the blocking pool.
    async fn read_persisted(&self) -> Option<Dataset> {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.read_persisted_blocking()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "cache read task failed; treating as a miss");
                None
            }
        }
    }

    fn read_persisted_blocking(&self) -> Option<Dataset> {
        let name = &self.inner.config.dataset_name;
        let data = self.read_key(&data_key(name));
        let hash = self.read_key(&hash_key(name));

        let (bytes, expected) = match (data, hash) {
            (Some(bytes), Some(hash_bytes)) => match String::from_utf8(hash_bytes) {
                Ok(expected) => (bytes, expected),
                Err(_) => {
                    warn!("persisted digest is not UTF-8; purging cached snapshot");
                    self.purge_persisted();
                    return None;
                }
            },
            (None, None) => return None,
            // Half a write is as good as none; clean it up.
            _ => {
                warn!("persisted snapshot is incomplete; purging");
                self.purge_persisted();
                return None;
            }
        };

        if !is_valid_snapshot(&bytes) || !verify_digest(&bytes, &expected) {
            warn!(
                bytes = bytes.len(),
                "persisted snapshot failed verification; purging and re-downloading"
            );
            self.purge_persisted();
            return None;
        }

        debug!(bytes = bytes.len(), "serving verified snapshot from cache");
        Some(Dataset::new(
            name.clone(),
            bytes,
            expected.trim().to_lowercase(),
            true,
            Some(self.inner.store.file_path(&data_key(name))),
        ))
    }

    fn read_key(&self, key: &str) -> Option<Vec<u8>> {
        match self.inner.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "durable store read failed");
                None
            }
        }
    }

    fn purge_persisted(&self) {
        let name = &self.inner.config.dataset_name;
        for key in [data_key(name), hash_key(name)] {
            if let Err(e) = self.inner.store.delete(&key) {
                warn!(key = %key.as_str(), error = %e, "failed to purge cached snapshot");
            }
        }
    }

    /// Download, decode, verify, persist and install a fresh snapshot
    async fn download_and_install(&self, progress: &ProgressSender) -> Result<Dataset> {
        // Advisory manifest fetch, concurrent with the download.
        let manifest_task = tokio::spawn({
            let client = self.inner.manifest_client.clone();
            async move { client.fetch().await }
        });

        progress.emit(LoadStage::Downloading, 5, "downloading snapshot", false);
        let report = |read: u64, total: Option<u64>| {
            progress.emit(
                LoadStage::Downloading,
                download_percent(read, total),
                "downloading snapshot",
                false,
            );
        };

        let raw = if self.inner.pipeline.is_supported() {
            match self.inner.source.fetch_snapshot(true, &report).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "compressed snapshot fetch failed; retrying uncompressed");
                    self.inner.source.fetch_snapshot(false, &report).await?
                }
            }
        } else {
            // No decode strategy available here; only the plain
            // variant is usable.
            self.inner.source.fetch_snapshot(false, &report).await?
        };

        progress.emit(LoadStage::Decompressing, 82, "decompressing snapshot", false);
        let bytes = Arc::new(self.inner.pipeline.decompress(raw).await?);

        progress.emit(LoadStage::Initializing, 90, "validating snapshot", false);
        if !is_valid_snapshot(&bytes) {
            return Err(integrity_error(&bytes));
        }
        let hash = digest_hex(&bytes);

        // Digest comparison against the manifest is advisory and only
        // runs when the manifest has already resolved.
        match manifest_task.now_or_never() {
            Some(Ok((Some(manifest), _))) => {
                if manifest.content_hash != hash {
                    warn!(
                        downloaded = %hash.as_str(),
                        manifest = %manifest.content_hash.as_str(),
                        "downloaded digest differs from manifest; edge caches may still be propagating"
                    );
                }
            }
            _ => debug!("manifest not yet available; skipping digest comparison"),
        }

        progress.emit(LoadStage::Initializing, 95, "persisting snapshot", false);
        let persisted_path = self.persist(Arc::clone(&bytes), &hash).await;

        if self.inner.closed.load(Ordering::SeqCst) {
            // The loader went away while we were downloading; discard.
            return Err(CapsidError::Closed);
        }

        let dataset = Dataset::new(
            self.inner.config.dataset_name.clone(),
            bytes,
            hash,
            false,
            persisted_path,
        );
        *self.inner.current.lock() = Some(dataset.clone());

        info!(
            bytes = dataset.len(),
            hash = %dataset.content_hash(),
            "snapshot ready"
        );
        progress.emit(LoadStage::Ready, 100, "snapshot ready", false);
        Ok(dataset)
    }

    /// Persist the verified snapshot, degrading to network-only on failure
    ///
    /// The write and fsync run on the blocking pool.
    async fn persist(&self, bytes: Arc<Vec<u8>>, hash: &str) -> Option<PathBuf> {
        if self.inner.persist_disabled.load(Ordering::SeqCst) {
            debug!("persistence disabled for this session; skipping");
            return None;
        }
        let this = self.clone();
        let hash = hash.to_string();
        match tokio::task::spawn_blocking(move || this.persist_blocking(&bytes, &hash)).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "persist task failed; snapshot not cached");
                None
            }
        }
    }

    fn persist_blocking(&self, bytes: &[u8], hash: &str) -> Option<PathBuf> {
        let name = &self.inner.config.dataset_name;

        // Data first, digest second: a reader that sees both keys can
        // trust that the digest describes the data.
        if let Err(e) = self.inner.store.put(&data_key(name), bytes) {
            self.disable_persistence(&e);
            return None;
        }
        if let Err(e) = self.inner.store.put(&hash_key(name), hash.as_bytes()) {
            self.disable_persistence(&e);
            let _ = self.inner.store.delete(&data_key(name));
            return None;
        }
        debug!(bytes = bytes.len(), "snapshot persisted");
        Some(self.inner.store.file_path(&data_key(name)))
    }

    fn disable_persistence(&self, err: &CapsidError) {
        match err {
            CapsidError::QuotaExceeded(msg) => warn!(
                error = %msg.as_str(),
                "storage quota exceeded; continuing network-only for this session"
            ),
            other => warn!(
                error = %other,
                "snapshot persistence failed; continuing network-only for this session"
            ),
        }
        self.inner.persist_disabled.store(true, Ordering::SeqCst);
    }

    /// Revalidate a served cache hit against the manifest, detached
    ///
    /// When the manifest advertises a different digest, a fresh
    /// snapshot is acquired in the background and installed as current;
    /// the next `load()` call returns it. The stale copy keeps serving
    /// in the meantime.
    fn spawn_revalidate(&self) {
        if self.inner.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.revalidate().await;
            this.inner.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }

    async fn revalidate(&self) {
        let (manifest, _) = self.inner.manifest_client.fetch().await;
        let current_hash = self
            .inner
            .current
            .lock()
            .as_ref()
            .map(|d| d.content_hash().to_string());

        let manifest = match manifest {
            Some(manifest) => manifest,
            None => {
                debug!("manifest unavailable; skipping revalidation");
                return;
            }
        };
        if Some(&manifest.content_hash) == current_hash.as_ref() {
            debug!("cached snapshot is current");
            return;
        }

        info!(
            advertised = %manifest.content_hash.as_str(),
            "snapshot update available; refreshing in background"
        );
        let _flight = self.inner.gate.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match self.download_and_install(&ProgressSender::disabled()).await {
            Ok(_) => info!("background refresh complete"),
            Err(e) => warn!(error = %e, "background refresh failed; keeping cached snapshot"),
        }
    }
}
