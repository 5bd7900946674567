//! Persisted cache info record
//!
//! Applies updates to a `.cinfo` file in place: a bit set rewrites the single
//! bitmap byte holding it, and an access record is written past the end of the
//! history before the count is bumped. A reader never sees a torn record.
//!
//! Every writer of one record must go through the same [`InfoFile`]; the
//! [`InfoRegistry`] hands out that shared instance per path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AccessRecord, CacheInfo};
use crate::cache::LocalStore;
use crate::error::{Error, Result};

/// A cache info record bound to its file in a [`LocalStore`]
pub struct InfoFile {
    store: Arc<dyn LocalStore>,
    path: PathBuf,
    info: CacheInfo,
    /// Serializes writes so the byte or count written is never older than one
    /// already on disk
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for InfoFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoFile").finish_non_exhaustive()
    }
}

impl InfoFile {
    /// Load an existing record
    pub async fn load(store: &dyn LocalStore, path: &Path) -> Result<CacheInfo> {
        let bytes = store.read_all(path).await?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))
        })?;
        CacheInfo::decode(&bytes)
    }

    /// Open the record at `path`, creating it if absent.
    ///
    /// An existing record whose geometry does not match `buffer_size` and
    /// `data_size` is replaced by an empty one. A record of an unsupported
    /// version is an error and is left untouched.
    pub async fn open_or_create(
        store: Arc<dyn LocalStore>,
        path: PathBuf,
        buffer_size: u64,
        data_size: u64,
    ) -> Result<Self> {
        let fresh = CacheInfo::new(buffer_size, data_size)?;

        let info = match store.read_all(&path).await? {
            Some(bytes) => match CacheInfo::decode(&bytes) {
                Ok(existing)
                    if existing.buffer_size() == fresh.buffer_size()
                        && existing.size_in_bits() == fresh.size_in_bits() =>
                {
                    debug!(
                        "Resuming {} with {}/{} chunks present",
                        path.display(),
                        existing.count_present(),
                        existing.size_in_bits()
                    );
                    return Ok(Self::bound(store, path, existing));
                }
                Ok(existing) => {
                    warn!(
                        "Discarding {}: geometry {}x{} does not match {}x{}",
                        path.display(),
                        existing.buffer_size(),
                        existing.size_in_bits(),
                        fresh.buffer_size(),
                        fresh.size_in_bits()
                    );
                    fresh
                }
                Err(e @ Error::UnsupportedInfoVersion { .. }) => return Err(e),
                Err(e) => {
                    warn!("Discarding unreadable {}: {}", path.display(), e);
                    fresh
                }
            },
            None => fresh,
        };

        store.write_at(&path, 0, &info.encode()).await?;
        Ok(Self::bound(store, path, info))
    }

    fn bound(store: Arc<dyn LocalStore>, path: PathBuf, info: CacheInfo) -> Self {
        Self {
            store,
            path,
            info,
            write_lock: Mutex::new(()),
        }
    }

    /// The in-memory record
    pub fn info(&self) -> &CacheInfo {
        &self.info
    }

    /// Path of the record in the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set a presence bit and persist the byte holding it
    pub async fn mark_present(&self, index: u32) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.info.mark_present(index);
        let byte = self.info.bitmap_byte(index);
        self.store
            .write_at(&self.path, CacheInfo::bitmap_offset(index), &[byte])
            .await
    }

    /// Append one access record, then publish it by bumping the count
    pub async fn append_access(&self, record: AccessRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let n = self.info.access_count();
        self.store
            .write_at(&self.path, self.info.access_record_offset(n), &record.encode())
            .await?;
        self.info.append_access(record);
        let count = (n + 1) as i32;
        self.store
            .write_at(
                &self.path,
                self.info.access_count_offset(),
                &count.to_le_bytes(),
            )
            .await
    }
}

/// Open info records of one cache, shared by every worker writing to them
#[derive(Default)]
pub(crate) struct InfoRegistry {
    open: Mutex<HashMap<PathBuf, Weak<InfoFile>>>,
}

impl InfoRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The live record at `path`, opening or creating it if no worker holds it
    pub(crate) async fn open(
        &self,
        store: Arc<dyn LocalStore>,
        path: PathBuf,
        buffer_size: u64,
        data_size: u64,
    ) -> Result<Arc<InfoFile>> {
        let mut open = self.open.lock().await;
        if let Some(file) = open.get(&path).and_then(Weak::upgrade) {
            debug!("Sharing open record {}", path.display());
            return Ok(file);
        }
        open.retain(|_, file| file.strong_count() > 0);

        let file = InfoFile::open_or_create(store, path.clone(), buffer_size, data_size).await?;
        let file = Arc::new(file);
        open.insert(path, Arc::downgrade(&file));
        Ok(file)
    }

    /// Records currently held by at least one worker
    pub(crate) async fn live_count(&self) -> usize {
        self.open
            .lock()
            .await
            .values()
            .filter(|file| file.strong_count() > 0)
            .count()
    }
}

// =============================================================================
// Tests
// =============================================================================
