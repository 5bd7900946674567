//! Block Cache - Per-File Block Registry
//!
//! Splits byte-range reads of one remote file across its blocks and owns the
//! registry of [`BlockWorker`]s, creating each lazily on first touch.
//!
//! # Read splitting
//!
//! ```text
//! block size 1000, file size 2500, read 600 @ 900
//!
//!   block 0 [0, 1000)      block 1 [1000, 2000)     block 2 [2000, 2500)
//!   ├───────────────┤██    ██████████████├─────────────┤ ├─────────┤
//!                  900..1000  1000..1500
//!                  100 bytes  500 bytes
//! ```
//!
//! Blocks are read strictly in ascending order. The registry lock is held only
//! to look up or insert a worker, never across a block read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::manager::CacheInner;
use super::path::block_file_name;
use super::remote::RemoteSource;
use super::stats::AccessStats;
use super::worker::{BlockRange, BlockWorker, WorkerContext};
use crate::error::{Error, Result};

/// Block cache for one open remote file
pub struct BlockCache {
    remote: Arc<dyn RemoteSource>,
    local_base: PathBuf,
    block_size: u64,
    file_size: u64,
    blocks: Mutex<BTreeMap<u64, Arc<BlockWorker>>>,
    ctx: WorkerContext,
    owner: Arc<CacheInner>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").finish_non_exhaustive()
    }
}

impl BlockCache {
    pub(crate) fn new(
        remote: Arc<dyn RemoteSource>,
        local_base: PathBuf,
        block_size: u64,
        ctx: WorkerContext,
        owner: Arc<CacheInner>,
    ) -> Self {
        let file_size = remote.fsize();
        Self {
            remote,
            local_base,
            block_size,
            file_size,
            blocks: Mutex::new(BTreeMap::new()),
            ctx,
            owner,
        }
    }

    /// Path of the remote file
    pub fn path(&self) -> &str {
        self.remote.path()
    }

    /// Local base name block files are derived from
    pub fn local_base(&self) -> &Path {
        &self.local_base
    }

    /// Block size used for this file
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Size of the remote file
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of blocks the file spans
    pub fn block_count(&self) -> u64 {
        self.file_size.div_ceil(self.block_size)
    }

    /// Byte range of block `index`, clamped to the file size
    pub fn block_range(&self, index: u64) -> BlockRange {
        let offset = index * self.block_size;
        BlockRange {
            index,
            offset,
            length: self.block_size.min(self.file_size.saturating_sub(offset)),
        }
    }

    /// Number of workers created so far
    pub fn worker_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Indices of the blocks that have a worker, ascending
    pub fn worker_indices(&self) -> Vec<u64> {
        self.blocks.lock().keys().copied().collect()
    }

    /// Worker for block `index`, if one was created
    pub fn worker(&self, index: u64) -> Option<Arc<BlockWorker>> {
        self.blocks.lock().get(&index).cloned()
    }

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read. A short count means a block delivered
    /// only part of its slice; the caller should continue from the new offset.
    /// An error means the first block touched delivered nothing, and any bytes
    /// of earlier blocks already copied into `buf` are not reported.
    #[instrument(skip(self, buf), fields(path = %self.remote.path(), size = buf.len()))]
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.file_size || buf.is_empty() {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.file_size - offset);
        let end = offset + size;
        let bs = self.block_size;
        let idx_first = offset / bs;
        let idx_last = (end - 1) / bs;

        debug!(
            "Read {}@{} block range [{}-{}]",
            size, offset, idx_first, idx_last
        );

        let mut bytes_read = 0usize;
        let mut pos = offset;
        for idx in idx_first..=idx_last {
            let worker = self.worker_for(idx);

            let read_len = if idx_first == idx_last {
                size
            } else if idx == idx_first {
                (idx + 1) * bs - offset
            } else if idx == idx_last {
                end - idx * bs
            } else {
                bs
            };

            let block_start = idx * bs;
            debug_assert!(read_len > 0, "zero-length slice of block {}", idx);
            debug_assert!(pos >= block_start && pos + read_len <= block_start + bs);
            if read_len == 0 || pos < block_start || pos + read_len > block_start + bs {
                return Err(Error::Internal(format!(
                    "slice {}@{} does not fit block {} of {}",
                    read_len,
                    pos,
                    idx,
                    self.remote.path()
                )));
            }

            let read_len = read_len as usize;
            let dst = &mut buf[bytes_read..bytes_read + read_len];
            match worker.read(dst, pos).await {
                Ok(n) if n == read_len => {
                    bytes_read += n;
                    pos += n as u64;
                }
                Ok(n) if n > 0 => {
                    warn!(
                        "Incomplete read of block {}, missing {} bytes{}",
                        idx,
                        read_len - n,
                        worker
                            .failure()
                            .map(|f| format!(": {}", f))
                            .unwrap_or_default()
                    );
                    return Ok(bytes_read + n);
                }
                Ok(_) => {
                    error!("Block {} delivered no data", idx);
                    return Err(Error::Internal(format!(
                        "block {} of {} delivered no data",
                        idx,
                        self.remote.path()
                    )));
                }
                Err(e) => {
                    error!("Read error in block {}: {}", idx, e);
                    return Err(e);
                }
            }
        }

        Ok(bytes_read)
    }

    /// Look up the worker for `index`, creating and starting it if absent.
    fn worker_for(&self, index: u64) -> Arc<BlockWorker> {
        let mut blocks = self.blocks.lock();
        blocks
            .entry(index)
            .or_insert_with(|| {
                let range = self.block_range(index);
                if range.length < self.block_size {
                    debug!(
                        "Last block {}, block file size {}",
                        index, range.length
                    );
                }
                let data_path = block_file_name(&self.local_base, self.block_size, range.offset);
                self.owner.stats.record_worker_created();
                Arc::new(BlockWorker::spawn(
                    self.remote.clone(),
                    self.ctx.clone(),
                    range,
                    data_path,
                ))
            })
            .clone()
    }

    /// Request every worker to stop; true if any is still draining.
    pub fn is_active(&self) -> bool {
        let workers: Vec<Arc<BlockWorker>> = self.blocks.lock().values().cloned().collect();
        let mut active = false;
        for worker in workers {
            if worker.initiate_close() {
                active = true;
            }
        }
        active
    }

    /// Statistics of all workers so far, without closing them
    pub fn stats(&self) -> AccessStats {
        let mut total = AccessStats::default();
        for worker in self.blocks.lock().values() {
            total.add(&worker.stats());
        }
        total
    }

    /// Shut down every worker, merge their statistics into the owning cache,
    /// and hand the remote source back to the caller.
    #[instrument(skip(self), fields(path = %self.remote.path()))]
    pub async fn detach(self) -> Arc<dyn RemoteSource> {
        info!("Detaching {}", self.remote.path());

        let workers: Vec<Arc<BlockWorker>> = std::mem::take(&mut *self.blocks.lock())
            .into_values()
            .collect();
        let results = join_all(workers.iter().map(|w| w.shutdown())).await;

        let mut total = AccessStats::default();
        for stats in &results {
            total.add(stats);
        }
        self.owner.release(self.remote.path(), &total);

        debug!(
            "Detached {}: {} workers, disk={} ram={} missed={}",
            self.remote.path(),
            workers.len(),
            total.bytes_disk,
            total.bytes_ram,
            total.bytes_missed
        );
        self.remote
    }
}

// =============================================================================
// Tests
// =============================================================================
