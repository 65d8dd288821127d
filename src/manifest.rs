//! Snapshot manifest schema and freshness client
//!
//! The manifest is a tiny JSON document published next to the snapshot:
//!
//! ```json
//! { "hash": "<64 hex chars>", "version": "2026-05" }
//! ```
//!
//! Unknown fields are ignored. The client layers conditional requests
//! and an offline fallback on top of a [`Source`], and is advisory
//! throughout: no manifest failure ever blocks dataset availability.

use crate::error::{CapsidError, Result};
use crate::source::Source;
use crate::store::BlobStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Length of a SHA-256 digest in hex
const DIGEST_HEX_LEN: usize = 64;

/// Published description of the current snapshot version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// SHA-256 hex digest of the uncompressed snapshot
    #[serde(rename = "hash")]
    pub content_hash: String,

    /// Free-form source version label, when the publisher provides one
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

impl SnapshotManifest {
    /// Parse and validate a manifest body
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: SnapshotManifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest.normalized())
    }

    /// Check the schema constraints the wire format promises
    pub fn validate(&self) -> Result<()> {
        let hash = self.content_hash.trim();
        if hash.len() != DIGEST_HEX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CapsidError::Manifest(format!(
                "hash must be {} hex characters, got '{}'",
                DIGEST_HEX_LEN, self.content_hash
            )));
        }
        Ok(())
    }

    /// Serialize for durable storage
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Fold the digest to its canonical lowercase spelling
    ///
    /// Publishers spell hex freely; everything downstream compares
    /// digests byte-for-byte.
    fn normalized(mut self) -> Self {
        self.content_hash = self.content_hash.trim().to_ascii_lowercase();
        self
    }
}

/// Result of a conditional manifest fetch
#[derive(Debug, Clone)]
pub enum ManifestFetch {
    /// Server returned a new manifest body
    Fresh {
        manifest: SnapshotManifest,
        etag: Option<String>,
    },
    /// Server confirmed the cached manifest is current
    NotModified,
}

/// Conditional manifest fetches with an offline fallback
///
/// Successful responses are cached durably together with their ETag so
/// later sessions can revalidate cheaply and offline sessions can fall
/// back to the last known manifest.
#[derive(Clone)]
pub struct ManifestClient {
    source: Arc<dyn Source>,
    store: Arc<BlobStore>,
    manifest_key: String,
    etag_key: String,
}

impl ManifestClient {
    pub fn new(source: Arc<dyn Source>, store: Arc<BlobStore>, dataset_name: &str) -> Self {
        ManifestClient {
            source,
            store,
            manifest_key: format!("{dataset_name}:manifest"),
            etag_key: format!("{dataset_name}:etag"),
        }
    }

    /// Fetch the current manifest
    ///
    /// Returns the manifest (if any could be obtained) and whether it
    /// was served from the durable cache rather than a fresh body.
    pub async fn fetch(&self) -> (Option<SnapshotManifest>, bool) {
        let etag = self.cached_etag();
        match self.source.fetch_manifest(etag.as_deref()).await {
            Ok(ManifestFetch::Fresh { manifest, etag }) => {
                let manifest = manifest.normalized();
                self.persist(&manifest, etag.as_deref());
                (Some(manifest), false)
            }
            Ok(ManifestFetch::NotModified) => {
                debug!("manifest not modified; reusing cached copy");
                (self.cached_manifest(), true)
            }
            Err(e) => {
                warn!(error = %e, "manifest fetch failed; falling back to cached copy");
                (self.cached_manifest(), true)
            }
        }
    }

    /// Last successfully cached manifest, if still parseable
    pub fn cached_manifest(&self) -> Option<SnapshotManifest> {
        let bytes = match self.store.get(&self.manifest_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "cached manifest unreadable");
                return None;
            }
        };
        match SnapshotManifest::parse(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!(error = %e, "cached manifest invalid; ignoring");
                None
            }
        }
    }

    fn cached_etag(&self) -> Option<String> {
        match self.store.get(&self.etag_key) {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    fn persist(&self, manifest: &SnapshotManifest, etag: Option<&str>) {
        let body = match manifest.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "manifest serialization failed; not caching");
                return;
            }
        };
        if let Err(e) = self.store.put(&self.manifest_key, &body) {
            warn!(error = %e, "failed to cache manifest");
            return;
        }
        let result = match etag {
            Some(tag) => self.store.put(&self.etag_key, tag.as_bytes()),
            None => self.store.delete(&self.etag_key),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to cache manifest etag");
        }
    }
}
