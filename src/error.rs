//! Error types for snapshot acquisition and caching

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, CapsidError>;

/// Errors raised while acquiring, verifying, or caching a snapshot
#[derive(Error, Debug)]
pub enum CapsidError {
    /// Transport failure or non-success HTTP status
    #[error("Network error: {0}")]
    Network(String),

    /// Every decode strategy failed on the payload
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Payload failed the magic or digest check
    #[error("Integrity check failed: {len} bytes, header [{header}]")]
    Integrity {
        /// Length of the rejected payload
        len: u64,
        /// Hex dump of the first bytes observed
        header: String,
    },

    /// Durable store is out of space; callers degrade to network-only
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No decode strategy is available in this environment
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// Manifest violated the wire schema
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Loader was closed while the operation was in flight
    #[error("Loader is closed")]
    Closed,

    /// SQLite error from an opened dataset
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
