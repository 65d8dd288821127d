//! Shared fixtures for the integration suite
//!
//! [`MockSource`] is a scripted stand-in for the HTTP endpoints: it
//! serves a configurable snapshot (plain or gzip-packaged), answers
//! conditional manifest fetches, and counts every call so tests can
//! assert on network traffic.

#![allow(dead_code)]

use async_trait::async_trait;
use capsid_rs::integrity::digest_hex;
use capsid_rs::manifest::{ManifestFetch, SnapshotManifest};
use capsid_rs::{CapsidConfig, CapsidError, Result, SnapshotLoader, Source, SNAPSHOT_MAGIC};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const DATASET: &str = "phage-db";

/// Deterministic payload that passes the snapshot format sniff
pub fn snapshot_bytes(seed: u8) -> Vec<u8> {
    let mut bytes = SNAPSHOT_MAGIC.to_vec();
    bytes.extend(std::iter::repeat(seed).take(4096));
    bytes
}

pub fn gzipped(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn manifest_for(bytes: &[u8]) -> SnapshotManifest {
    SnapshotManifest {
        content_hash: digest_hex(bytes),
        source_version: None,
    }
}

/// Path of the persisted snapshot payload under a loader's cache dir
pub fn persisted_data_path(dir: &TempDir) -> PathBuf {
    dir.path().join("snapshot").join("phage-db_data")
}

pub fn persisted_hash_path(dir: &TempDir) -> PathBuf {
    dir.path().join("snapshot").join("phage-db_hash")
}

pub fn persisted_manifest_path(dir: &TempDir) -> PathBuf {
    dir.path().join("snapshot").join("phage-db_manifest")
}

pub fn test_config(dir: &TempDir) -> CapsidConfig {
    CapsidConfig::new(
        DATASET,
        "http://127.0.0.1:9/phage-db.sqlite",
        "http://127.0.0.1:9/manifest.json",
        dir.path(),
    )
}

pub fn loader_over(dir: &TempDir, source: Arc<MockSource>) -> SnapshotLoader {
    SnapshotLoader::with_source(test_config(dir), source).unwrap()
}

/// Scripted network endpoint with call accounting
pub struct MockSource {
    snapshot: Mutex<Vec<u8>>,
    manifest: Mutex<Option<(SnapshotManifest, Option<String>)>>,
    fail_compressed: AtomicBool,
    fail_snapshots: AtomicBool,
    snapshot_delay: Mutex<Option<Duration>>,
    pub snapshot_fetches: AtomicUsize,
    pub compressed_fetches: AtomicUsize,
    pub manifest_fetches: AtomicUsize,
}

impl MockSource {
    /// Serve `snapshot`, with a manifest announcing its digest
    ///
    /// The etag is derived from the digest so distinct payloads carry
    /// distinct validators, the way a real server would.
    pub fn serving(snapshot: Vec<u8>) -> Arc<Self> {
        let manifest = manifest_for(&snapshot);
        let etag = format!("\"{}\"", &manifest.content_hash[..8]);
        let source = Self::without_manifest(snapshot);
        source.announce(manifest, Some(&etag));
        source
    }

    /// Serve `snapshot` with no manifest published
    pub fn without_manifest(snapshot: Vec<u8>) -> Arc<Self> {
        Arc::new(MockSource {
            snapshot: Mutex::new(snapshot),
            manifest: Mutex::new(None),
            fail_compressed: AtomicBool::new(false),
            fail_snapshots: AtomicBool::new(false),
            snapshot_delay: Mutex::new(None),
            snapshot_fetches: AtomicUsize::new(0),
            compressed_fetches: AtomicUsize::new(0),
            manifest_fetches: AtomicUsize::new(0),
        })
    }

    /// Replace the served snapshot and announce its digest
    pub fn publish(&self, snapshot: Vec<u8>, etag: Option<&str>) {
        let manifest = manifest_for(&snapshot);
        *self.snapshot.lock() = snapshot;
        self.announce(manifest, etag);
    }

    pub fn announce(&self, manifest: SnapshotManifest, etag: Option<&str>) {
        *self.manifest.lock() = Some((manifest, etag.map(str::to_string)));
    }

    /// Make compressed snapshot fetches fail with a network error
    pub fn fail_compressed(&self) {
        self.fail_compressed.store(true, Ordering::SeqCst);
    }

    /// Make every snapshot fetch fail with a network error
    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Hold every snapshot fetch for `delay` before answering
    pub fn delay_snapshots(&self, delay: Duration) {
        *self.snapshot_delay.lock() = Some(delay);
    }

    pub fn snapshot_fetch_count(&self) -> usize {
        self.snapshot_fetches.load(Ordering::SeqCst)
    }

    pub fn manifest_fetch_count(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MockSource {
    async fn fetch_snapshot(
        &self,
        compressed: bool,
        report: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>> {
        self.snapshot_fetches.fetch_add(1, Ordering::SeqCst);
        if compressed {
            self.compressed_fetches.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.snapshot_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(CapsidError::Network("connection refused".to_string()));
        }
        if compressed && self.fail_compressed.load(Ordering::SeqCst) {
            return Err(CapsidError::Network(
                "compressed variant unavailable".to_string(),
            ));
        }

        let plain = self.snapshot.lock().clone();
        let payload = if compressed { gzipped(&plain) } else { plain };
        let total = payload.len() as u64;
        report(total / 2, Some(total));
        report(total, Some(total));
        Ok(payload)
    }

    async fn fetch_manifest(&self, etag: Option<&str>) -> Result<ManifestFetch> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let published = self.manifest.lock().clone();
        match published {
            None => Err(CapsidError::Network("no manifest published".to_string())),
            Some((_, ref current)) if current.is_some() && current.as_deref() == etag => {
                Ok(ManifestFetch::NotModified)
            }
            Some((manifest, current)) => Ok(ManifestFetch::Fresh {
                manifest,
                etag: current,
            }),
        }
    }
}
