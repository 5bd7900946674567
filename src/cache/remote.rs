//! Remote Source
//!
//! The byte-addressable remote file a [`BlockCache`](super::BlockCache) sits in
//! front of. The real remote access layer lives outside this crate; it only has
//! to provide the size, the path and positional reads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

/// Remote file trait
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Path or URL of the remote file, including any query hints
    fn path(&self) -> &str;

    /// True size of the remote file in bytes
    fn fsize(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Remote source backed by a byte buffer (for testing and demos)
pub struct InMemorySource {
    path: String,
    data: Bytes,
    reads: AtomicU64,
}

impl InMemorySource {
    /// Create a new in-memory source
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            reads: AtomicU64::new(0),
        }
    }

    /// Number of range reads served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteSource for InMemorySource {
    fn path(&self) -> &str {
        &self.path
    }

    fn fsize(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Remote source backed by a local file, for exercising the cache from the CLI
pub struct LocalFileSource {
    path: String,
    file_path: PathBuf,
    size: u64,
}

impl LocalFileSource {
    /// Open a local file. `path` is the name reported to the cache and may
    /// carry query hints such as `?hdfsbsize=`.
    pub async fn open(file_path: impl Into<PathBuf>, path: impl Into<String>) -> Result<Self> {
        let file_path = file_path.into();
        let size = tokio::fs::metadata(&file_path).await?.len();
        Ok(Self {
            path: path.into(),
            file_path,
            size,
        })
    }
}

#[async_trait]
impl RemoteSource for LocalFileSource {
    fn path(&self) -> &str {
        &self.path
    }

    fn fsize(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = tokio::fs::File::open(&self.file_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

// =============================================================================
// Tests
// =============================================================================
