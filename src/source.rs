//! Remote snapshot endpoints
//!
//! [`Source`] is the seam between the load orchestration and the
//! network. Production code uses [`HttpSource`](crate::fetch::HttpSource);
//! tests substitute scripted implementations.

use crate::error::Result;
use crate::manifest::ManifestFetch;
use async_trait::async_trait;

/// Where snapshots and manifests come from
#[async_trait]
pub trait Source: Send + Sync {
    /// Stream the snapshot payload into memory
    ///
    /// `compressed` selects the gzip variant of the snapshot. `report`
    /// is called after every received chunk with the byte count so far
    /// and the declared total, when that total can be trusted.
    async fn fetch_snapshot(
        &self,
        compressed: bool,
        report: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>>;

    /// Conditionally fetch the manifest
    ///
    /// `etag` is the validator from the last fresh response, if one was
    /// cached. Implementations answer [`ManifestFetch::NotModified`]
    /// when the server confirms the validator still matches.
    async fn fetch_manifest(&self, etag: Option<&str>) -> Result<ManifestFetch>;
}
