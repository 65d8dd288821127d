//! Durable key-value store for opaque blobs
//!
//! Each key maps to one file under the store root. Writes go through a
//! temp file plus rename so readers never observe a partial value, and
//! an optional byte quota turns over-limit writes into
//! [`CapsidError::QuotaExceeded`] without touching existing entries.

use crate::error::{CapsidError, Result};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// ENOSPC, for platforms where the error kind is not mapped
const ENOSPC: i32 = 28;

/// Durable blob store rooted at one directory
pub struct BlobStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
    used_bytes: Mutex<u64>,
    tmp_counter: AtomicU64,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(root.as_ref(), None)
    }

    /// Open a store with a soft byte quota across all values
    pub fn with_quota(root: impl AsRef<Path>, quota_bytes: u64) -> Result<Self> {
        Self::open_inner(root.as_ref(), Some(quota_bytes))
    }

    fn open_inner(root: &Path, quota_bytes: Option<u64>) -> Result<Self> {
        fs::create_dir_all(root)?;
        let mut used = 0u64;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Temp files left behind by a crashed writer are not
            // entries; sweep them rather than charge the quota.
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.contains(".tmp-")) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    debug!(file = %entry.path().display(), error = %e, "failed to sweep temp file");
                }
                continue;
            }
            used += entry.metadata()?.len();
        }
        Ok(BlobStore {
            root: root.to_path_buf(),
            quota_bytes,
            used_bytes: Mutex::new(used),
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// On-disk path for a key
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    /// Read the value stored under `key`, if any
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a value exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.file_path(key).is_file()
    }

    /// Write `bytes` under `key`, replacing any previous value
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.file_path(key);

        // Size the replaced value under the accounting lock; two
        // same-key writers must never both credit it.
        let mut used = self.used_bytes.lock();
        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if let Some(quota) = self.quota_bytes {
            let projected = used.saturating_sub(existing) + bytes.len() as u64;
            if projected > quota {
                return Err(CapsidError::QuotaExceeded(format!(
                    "writing {} bytes under '{}' would use {} of {} byte quota",
                    bytes.len(),
                    key,
                    projected,
                    quota
                )));
            }
        }

        let tmp = self.root.join(format!(
            "{}.tmp-{}",
            sanitize_key(key),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_and_sync(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(map_full(e));
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(map_full(e.into()));
        }
        sync_dir(&self.root).map_err(map_full)?;

        *used = used.saturating_sub(existing) + bytes.len() as u64;
        debug!(key, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    /// Delete the value under `key`; absent keys are not an error
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.file_path(key);
        let mut used = self.used_bytes.lock();
        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => {
                *used = used.saturating_sub(existing);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All keys currently stored
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Skip temp files left behind by a crashed writer.
                if !name.contains(".tmp-") {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Total bytes currently stored
    pub fn total_bytes(&self) -> u64 {
        *self.used_bytes.lock()
    }
}

/// Map a key onto a safe file name
///
/// Keys use `:` as a namespace separator; file names keep only
/// alphanumerics plus `.`, `_` and `-`.
pub(crate) fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

/// Turn an out-of-space I/O error into the quota error callers degrade on
fn map_full(err: CapsidError) -> CapsidError {
    if let CapsidError::Io(io) = &err {
        if io.kind() == ErrorKind::StorageFull || io.raw_os_error() == Some(ENOSPC) {
            return CapsidError::QuotaExceeded(io.to_string());
        }
    }
    err
}
