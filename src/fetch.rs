//! HTTP snapshot and manifest endpoints
//!
//! Streams snapshot payloads chunk by chunk so callers can surface
//! byte-level progress, and runs conditional manifest requests with the
//! standard validator headers.
//!
//! The declared content length is only trusted for progress mapping
//! when the payload is not opaquely transformed in transit: once a
//! `Content-Encoding` other than identity shows up, the declared length
//! describes the wire bytes rather than the payload we accumulate.

use crate::config::CapsidConfig;
use crate::error::{CapsidError, Result};
use crate::manifest::{ManifestFetch, SnapshotManifest};
use crate::source::Source;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Cap on upfront buffer reservation from a declared length
const MAX_PREALLOC_BYTES: u64 = 256 * 1024 * 1024;

/// Snapshot endpoints reached over HTTP
pub struct HttpSource {
    client: Client,
    snapshot_url: String,
    manifest_url: String,
    timeout: Option<Duration>,
}

impl HttpSource {
    /// Build a source for the given snapshot and manifest URLs
    pub fn new(snapshot_url: impl Into<String>, manifest_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| CapsidError::Network(e.to_string()))?;
        Ok(HttpSource {
            client,
            snapshot_url: snapshot_url.into(),
            manifest_url: manifest_url.into(),
            timeout: None,
        })
    }

    /// Build a source from a loader configuration
    pub fn from_config(config: &CapsidConfig) -> Result<Self> {
        Ok(Self::new(&config.dataset_url, &config.manifest_url)?
            .with_timeout(config.fetch_timeout))
    }

    /// Set or disable the per-request timeout
    ///
    /// The timeout covers the whole request, body included.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn fetch_snapshot(
        &self,
        compressed: bool,
        report: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let url = if compressed {
            format!("{}.gz", self.snapshot_url)
        } else {
            self.snapshot_url.clone()
        };

        let mut response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| CapsidError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CapsidError::Network(format!(
                "snapshot fetch from '{url}' failed: HTTP {status}"
            )));
        }

        let total = trusted_length(response.headers(), response.content_length());
        let mut payload =
            Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOC_BYTES) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CapsidError::Network(e.to_string()))?
        {
            payload.extend_from_slice(&chunk);
            report(payload.len() as u64, total);
        }

        debug!(url = %url, bytes = payload.len(), "snapshot download complete");
        Ok(payload)
    }

    async fn fetch_manifest(&self, etag: Option<&str>) -> Result<ManifestFetch> {
        let mut request = self.get(&self.manifest_url);
        if let Some(tag) = etag {
            request = request.header(IF_NONE_MATCH, tag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CapsidError::Network(e.to_string()))?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(ManifestFetch::NotModified);
        }
        if !response.status().is_success() {
            return Err(CapsidError::Network(format!(
                "manifest fetch from '{}' failed: HTTP {}",
                self.manifest_url,
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| CapsidError::Network(e.to_string()))?;
        let manifest = SnapshotManifest::parse(&body)?;
        Ok(ManifestFetch::Fresh { manifest, etag })
    }
}

/// Declared length, when it can be trusted for progress mapping
fn trusted_length(headers: &HeaderMap, declared: Option<u64>) -> Option<u64> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("identity");
    if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") {
        declared
    } else {
        None
    }
}
