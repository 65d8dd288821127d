//! Verified snapshot handle

use crate::error::Result;
use once_cell::sync::OnceCell;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A verified snapshot, ready to be queried
///
/// Handles are cheap to clone and share the underlying bytes. The hash
/// is the SHA-256 hex digest of exactly those bytes, and
/// `served_from_cache` records whether they came from the durable cache
/// or a fresh download.
#[derive(Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

struct DatasetInner {
    name: String,
    bytes: Arc<Vec<u8>>,
    content_hash: String,
    served_from_cache: bool,
    persisted_path: Option<PathBuf>,
    spill: OnceCell<NamedTempFile>,
}

impl Dataset {
    pub(crate) fn new(
        name: impl Into<String>,
        bytes: impl Into<Arc<Vec<u8>>>,
        content_hash: String,
        served_from_cache: bool,
        persisted_path: Option<PathBuf>,
    ) -> Self {
        Dataset {
            inner: Arc::new(DatasetInner {
                name: name.into(),
                bytes: bytes.into(),
                content_hash,
                served_from_cache,
                persisted_path,
                spill: OnceCell::new(),
            }),
        }
    }

    /// Logical dataset name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raw snapshot bytes
    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// Snapshot size in bytes
    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// SHA-256 hex digest of the snapshot bytes
    pub fn content_hash(&self) -> &str {
        &self.inner.content_hash
    }

    /// Whether these bytes were served from the durable cache
    pub fn served_from_cache(&self) -> bool {
        self.inner.served_from_cache
    }

    /// Open a read-only SQLite connection over the snapshot
    ///
    /// Uses the durably cached file when one exists; otherwise the
    /// bytes are spilled once to a temp file that lives as long as the
    /// handle.
    pub fn open_readonly(&self) -> Result<Connection> {
        let path = match &self.inner.persisted_path {
            Some(path) => path.clone(),
            None => self
                .inner
                .spill
                .get_or_try_init(|| -> Result<NamedTempFile> {
                    let mut file = NamedTempFile::new()?;
                    file.write_all(&self.inner.bytes)?;
                    file.flush()?;
                    Ok(file)
                })?
                .path()
                .to_path_buf(),
        };
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.inner.name)
            .field("len", &self.inner.bytes.len())
            .field("content_hash", &self.inner.content_hash)
            .field("served_from_cache", &self.inner.served_from_cache)
            .field("persisted_path", &self.inner.persisted_path)
            .finish()
    }
}
