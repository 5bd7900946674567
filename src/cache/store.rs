//! Local Store
//!
//! Persists cached block bytes and `.cinfo` records. Paths are relative to the
//! store root.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;

/// Local persistence trait
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset` of `path`
    async fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at `offset` of `path`, creating the file if needed
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()>;

    /// Read a whole file, or `None` if it does not exist
    async fn read_all(&self, path: &Path) -> Result<Option<Bytes>>;

    /// Check if a file exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get store statistics
    fn stats(&self) -> LocalStoreStats;
}

/// Local store statistics
#[derive(Debug, Clone, Default)]
pub struct LocalStoreStats {
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Bytes written
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
}

impl StoreCounters {
    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LocalStoreStats {
        LocalStoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Store backed by a directory on the local filesystem
pub struct LocalFsStore {
    root: PathBuf,
    counters: StoreCounters,
}

impl LocalFsStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: StoreCounters::default(),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl LocalStore for LocalFsStore {
    async fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.counters.record_read();
        let mut file = tokio::fs::File::open(self.full_path(path)).await?;
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

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        self.counters.record_write(data.len());
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self, path: &Path) -> Result<Option<Bytes>> {
        self.counters.record_read();
        match tokio::fs::read(self.full_path(path)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.full_path(path)).await?)
    }

    fn stats(&self) -> LocalStoreStats {
        self.counters.snapshot()
    }
}

/// In-memory store for testing
/// Uses DashMap so workers of different blocks never contend on one lock
#[derive(Default)]
pub struct InMemoryStore {
    files: DashMap<PathBuf, Vec<u8>>,
    counters: StoreCounters,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files held
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths of all files held, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.counters.record_read();
        let file = self.files.get(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })?;
        let start = offset as usize;
        if start >= file.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        self.counters.record_write(data.len());
        let mut file = self.files.entry(path.to_path_buf()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_all(&self, path: &Path) -> Result<Option<Bytes>> {
        self.counters.record_read();
        Ok(self
            .files
            .get(path)
            .map(|file| Bytes::copy_from_slice(file.value())))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.contains_key(path))
    }

    fn stats(&self) -> LocalStoreStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
