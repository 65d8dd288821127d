//! Snapshot integrity checks
//!
//! Every valid snapshot is a SQLite database, so the first 16 bytes must
//! be the SQLite magic. Digests are SHA-256 over the uncompressed bytes,
//! rendered as lowercase hex.

use crate::error::CapsidError;
use sha2::{Digest, Sha256};

/// Magic bytes at offset 0 of every valid snapshot
pub const SNAPSHOT_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Bytes of the payload included in integrity diagnostics
const HEADER_PREVIEW_LEN: usize = 16;

/// Check that `bytes` starts with the snapshot magic
pub fn is_valid_snapshot(bytes: &[u8]) -> bool {
    bytes.len() >= SNAPSHOT_MAGIC.len() && &bytes[..SNAPSHOT_MAGIC.len()] == SNAPSHOT_MAGIC
}

/// SHA-256 digest of `bytes` as lowercase hex
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compare `bytes` against an expected hex digest, case-insensitively
pub fn verify_digest(bytes: &[u8], expected_hex: &str) -> bool {
    digest_hex(bytes).eq_ignore_ascii_case(expected_hex.trim())
}

/// Hex dump of the first bytes of a payload, for diagnostics
pub fn header_preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(HEADER_PREVIEW_LEN)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the fatal integrity error for a rejected payload
pub fn integrity_error(bytes: &[u8]) -> CapsidError {
    CapsidError::Integrity {
        len: bytes.len() as u64,
        header: header_preview(bytes),
    }
}
