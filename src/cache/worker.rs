//! Block Worker
//!
//! Owns the fetch-and-serve lifecycle of one block of a remote file. A
//! background task pulls the block from the remote source in `buffer_size`
//! chunks, writes each chunk to the local block file and sets its bit in the
//! block's `.cinfo` record. Readers wait on a progress channel until the chunks
//! they need are present, failed, or the worker is closed.
//!
//! # Chunk lifecycle
//!
//! ```text
//! Missing ──fetch ok──▶ Present
//!    │
//!    └──fetch error──▶ Failed   (every chunk still Missing fails with it)
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::path::info_file_name;
use super::remote::RemoteSource;
use super::stats::{AccessCounters, AccessStats};
use super::store::LocalStore;
use crate::error::{Error, Result};
use crate::info::{AccessRecord, InfoFile, InfoRegistry};

/// Resources every worker of a cache shares
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) fetch_permits: Arc<Semaphore>,
    /// Info records shared with workers of other handles on the same file
    pub(crate) infos: Arc<InfoRegistry>,
    pub(crate) buffer_size: u64,
    pub(crate) ram_buffers: usize,
}

/// Byte range of one block within its remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Block index (`offset / block_size`)
    pub index: u64,
    /// Absolute offset of the block's first byte
    pub offset: u64,
    /// Length of the block; shorter than the block size only for the last block
    pub length: u64,
}

impl BlockRange {
    /// Absolute offset one past the block's last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset + len <= self.end()
    }
}

#[derive(Debug, Clone)]
enum ChunkState {
    Missing,
    Present,
    Failed(Arc<Error>),
}

/// Where a present chunk can be served from
enum ChunkSource {
    Ram(Bytes),
    Disk,
}

struct FetchState {
    chunks: Vec<ChunkState>,
    /// Chunks readers are blocked on, fetched ahead of the sequential sweep
    wanted: VecDeque<u32>,
    /// Most recently fetched chunks, oldest first
    ram: VecDeque<(u32, Bytes)>,
    /// Set once the info file has been read and present chunks marked
    loaded: bool,
    /// Set once the fetch task has exited
    closed: bool,
}

impl FetchState {
    fn next_missing(&mut self) -> Option<u32> {
        while let Some(idx) = self.wanted.pop_front() {
            if matches!(self.chunks[idx as usize], ChunkState::Missing) {
                return Some(idx);
            }
        }
        self.chunks
            .iter()
            .position(|c| matches!(c, ChunkState::Missing))
            .map(|i| i as u32)
    }

    fn ram_lookup(&self, idx: u32) -> Option<Bytes> {
        self.ram
            .iter()
            .find(|(i, _)| *i == idx)
            .map(|(_, data)| data.clone())
    }

    fn fail_missing(&mut self, err: Arc<Error>) {
        for chunk in self.chunks.iter_mut() {
            if matches!(chunk, ChunkState::Missing) {
                *chunk = ChunkState::Failed(err.clone());
            }
        }
    }

    fn first_failure(&self) -> Option<Arc<Error>> {
        self.chunks.iter().find_map(|c| match c {
            ChunkState::Failed(e) => Some(e.clone()),
            _ => None,
        })
    }
}

struct Shared {
    origin: String,
    range: BlockRange,
    data_path: PathBuf,
    remote: Arc<dyn RemoteSource>,
    ctx: WorkerContext,
    state: Mutex<FetchState>,
    progress: watch::Sender<u64>,
    cancel: CancellationToken,
    finished: AtomicBool,
    counters: AccessCounters,
    info: OnceLock<Arc<InfoFile>>,
}

/// Fetch-and-serve owner of one block
pub struct BlockWorker {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWorker").finish_non_exhaustive()
    }
}

impl BlockWorker {
    /// Create a worker and start its background fetch task.
    ///
    /// Must be called from within a tokio runtime. Does not block.
    pub(crate) fn spawn(
        remote: Arc<dyn RemoteSource>,
        ctx: WorkerContext,
        range: BlockRange,
        data_path: PathBuf,
    ) -> Self {
        let n_chunks = range.length.div_ceil(ctx.buffer_size) as usize;
        let (progress, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            origin: remote.path().to_string(),
            range,
            data_path,
            remote,
            ctx,
            state: Mutex::new(FetchState {
                chunks: vec![ChunkState::Missing; n_chunks],
                wanted: VecDeque::new(),
                ram: VecDeque::new(),
                loaded: false,
                closed: false,
            }),
            progress,
            cancel: CancellationToken::new(),
            finished: AtomicBool::new(false),
            counters: AccessCounters::default(),
            info: OnceLock::new(),
        });

        debug!(
            "Spawning fetch for block {} [{}, {}) of {} into {}",
            range.index,
            range.offset,
            range.end(),
            shared.origin,
            shared.data_path.display()
        );
        let task = tokio::spawn(Shared::run(shared.clone()));

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Byte range this worker owns
    pub fn range(&self) -> BlockRange {
        self.shared.range
    }

    /// Local block file path, relative to the store root
    pub fn data_path(&self) -> &Path {
        &self.shared.data_path
    }

    /// Read `buf.len()` bytes at absolute `offset`, waiting for missing chunks.
    ///
    /// Returns fewer bytes than requested when a later chunk of the range has
    /// failed or the worker closed after an earlier chunk was delivered. Fails
    /// only when nothing could be delivered.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let shared = &self.shared;
        let range = shared.range;
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(0);
        }
        if !range.contains(offset, len) {
            return Err(Error::Internal(format!(
                "read {}@{} outside block {} [{}, {})",
                len,
                offset,
                range.index,
                range.offset,
                range.end()
            )));
        }

        let bs = shared.ctx.buffer_size;
        let rel_start = offset - range.offset;
        let rel_end = rel_start + len;
        let first = rel_start / bs;
        let last = (rel_end - 1) / bs;
        let mut done = 0usize;

        for idx in first..=last {
            let chunk_start = idx * bs;
            let seg_start = rel_start.max(chunk_start);
            let seg_end = rel_end.min(chunk_start + bs);
            let seg_len = (seg_end - seg_start) as usize;
            let dst = &mut buf[done..done + seg_len];

            let (source, waited) = match shared.wait_for_chunk(idx as u32).await {
                Ok(found) => found,
                Err(e) if done > 0 => {
                    debug!("Block {} short read after {} bytes: {}", range.index, done, e);
                    return Ok(done);
                }
                Err(e) => return Err(e),
            };

            let served_from_ram = match source {
                ChunkSource::Ram(data) => {
                    let from = (seg_start - chunk_start) as usize;
                    dst.copy_from_slice(&data[from..from + seg_len]);
                    true
                }
                ChunkSource::Disk => {
                    let n = match shared
                        .ctx
                        .store
                        .read_at(&shared.data_path, seg_start, dst)
                        .await
                    {
                        Ok(n) => n,
                        Err(e) if done > 0 => {
                            warn!("Block {} local read failed: {}", range.index, e);
                            return Ok(done);
                        }
                        Err(e) => return Err(e),
                    };
                    if n < seg_len {
                        warn!(
                            "Block file {} shorter than expected: {} of {} bytes at {}",
                            shared.data_path.display(),
                            n,
                            seg_len,
                            seg_start
                        );
                        shared.record_served(n, waited, false);
                        return Ok(done + n);
                    }
                    false
                }
            };

            shared.record_served(seg_len, waited, served_from_ram);
            done += seg_len;
        }

        Ok(done)
    }

    /// Ask the fetch task to stop after its current chunk.
    ///
    /// Returns true while the task is still running. Safe to call repeatedly.
    pub fn initiate_close(&self) -> bool {
        self.shared.cancel.cancel();
        !self.shared.finished.load(Ordering::Acquire)
    }

    /// True once the fetch task has exited
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// True when every chunk of the block is present locally
    pub fn is_complete(&self) -> bool {
        self.shared
            .state
            .lock()
            .chunks
            .iter()
            .all(|c| matches!(c, ChunkState::Present))
    }

    /// Snapshot of the bytes served so far
    pub fn stats(&self) -> AccessStats {
        self.shared.counters.snapshot()
    }

    /// The fetch failure recorded against this block, if any
    pub fn failure(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .first_failure()
            .map(|e| e.to_string())
    }

    /// Close the worker, wait for the fetch task, and append an access record.
    ///
    /// Never fails: problems while flushing the record are logged.
    pub async fn shutdown(&self) -> AccessStats {
        self.shared.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(
                    "Fetch task for block {} of {} ended abnormally: {}",
                    self.shared.range.index, self.shared.origin, e
                );
            }
        }

        let stats = self.stats();
        if let Some(info) = self.shared.info.get() {
            let record = AccessRecord::new(Utc::now().timestamp(), &stats);
            if let Err(e) = info.append_access(record).await {
                warn!(
                    "Failed to append access record to {}: {}",
                    info.path().display(),
                    e
                );
            }
        }
        stats
    }
}

impl Drop for BlockWorker {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        let info_path = info_file_name(&self.data_path);
        let info = match self.ctx.infos.open(
            self.ctx.store.clone(),
            info_path.clone(),
            self.ctx.buffer_size,
            self.range.length,
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                error!(
                    "Cannot open cache info {} for {}: {}",
                    info_path.display(),
                    self.origin,
                    e
                );
                self.state.lock().fail_missing(Arc::new(e));
                self.finish();
                return;
            }
        };

        {
            let mut state = self.state.lock();
            for idx in info.info().present_indices() {
                if let Some(chunk) = state.chunks.get_mut(idx as usize) {
                    *chunk = ChunkState::Present;
                }
            }
            state.loaded = true;
        }
        let _ = self.info.set(info.clone());
        self.publish();

        loop {
            if self.cancel.is_cancelled() {
                debug!("Fetch for block {} of {} cancelled", self.range.index, self.origin);
                break;
            }
            let next = self.state.lock().next_missing();
            let Some(idx) = next else {
                info!(
                    "Block {} of {} fully cached",
                    self.range.index, self.origin
                );
                break;
            };

            // Another handle's worker may have fetched it since the load
            if info.info().test_bit(idx) {
                self.state.lock().chunks[idx as usize] = ChunkState::Present;
                self.publish();
                continue;
            }

            let permit = tokio::select! {
                permit = self.ctx.fetch_permits.acquire() => permit,
                _ = self.cancel.cancelled() => break,
            };
            let Ok(_permit) = permit else {
                warn!("Fetch pool closed, stopping block {}", self.range.index);
                break;
            };

            match self.fetch_chunk(idx).await {
                Ok(data) => {
                    if let Err(e) = info.mark_present(idx).await {
                        warn!(
                            "Failed to persist presence of chunk {} in {}: {}",
                            idx,
                            info.path().display(),
                            e
                        );
                    }
                    {
                        let mut state = self.state.lock();
                        state.chunks[idx as usize] = ChunkState::Present;
                        if self.ctx.ram_buffers > 0 {
                            state.ram.push_back((idx, data));
                            while state.ram.len() > self.ctx.ram_buffers {
                                state.ram.pop_front();
                            }
                        }
                    }
                    self.publish();
                }
                Err(e) => {
                    error!(
                        "Fetch of block {} chunk {} of {} failed: {}",
                        self.range.index, idx, self.origin, e
                    );
                    self.state.lock().fail_missing(Arc::new(e));
                    break;
                }
            }
        }

        self.finish();
    }

    /// Pull one chunk from the remote source and write it to the block file
    async fn fetch_chunk(&self, idx: u32) -> Result<Bytes> {
        let bs = self.ctx.buffer_size;
        let chunk_start = idx as u64 * bs;
        let chunk_len = bs.min(self.range.length - chunk_start) as usize;
        let remote_offset = self.range.offset + chunk_start;

        let mut buf = vec![0u8; chunk_len];
        let mut filled = 0;
        while filled < chunk_len {
            let at = remote_offset + filled as u64;
            let n = self
                .remote
                .read_at(at, &mut buf[filled..])
                .await
                .map_err(|e| Error::RemoteFetch {
                    path: self.origin.clone(),
                    offset: at,
                    reason: e.to_string(),
                })?;
            if n == 0 {
                return Err(Error::ShortRemoteRead {
                    path: self.origin.clone(),
                    offset: remote_offset,
                    expected: chunk_len,
                    got: filled,
                });
            }
            filled += n;
        }

        self.ctx
            .store
            .write_at(&self.data_path, chunk_start, &buf)
            .await?;
        Ok(Bytes::from(buf))
    }

    /// Wait until chunk `idx` is present, returning where to serve it from
    /// and whether the caller had to wait for a fetch.
    async fn wait_for_chunk(&self, idx: u32) -> Result<(ChunkSource, bool)> {
        let mut progress = self.progress.subscribe();
        let mut waited = false;
        let mut queued = false;
        loop {
            {
                let mut state = self.state.lock();
                let current = state.chunks[idx as usize].clone();
                match current {
                    ChunkState::Present => {
                        let source = match state.ram_lookup(idx) {
                            Some(data) => ChunkSource::Ram(data),
                            None => ChunkSource::Disk,
                        };
                        return Ok((source, waited));
                    }
                    ChunkState::Failed(e) => {
                        let at = self.range.offset + idx as u64 * self.ctx.buffer_size;
                        return Err(e.duplicate(&self.origin, at));
                    }
                    ChunkState::Missing if state.closed => {
                        return Err(Error::WorkerClosed {
                            path: self.origin.clone(),
                            block: self.range.index,
                        });
                    }
                    ChunkState::Missing => {
                        if !queued {
                            state.wanted.push_back(idx);
                            queued = true;
                        }
                        // Waiting on the info file load is not a miss
                        if state.loaded {
                            waited = true;
                        }
                    }
                }
            }
            if progress.changed().await.is_err() {
                return Err(Error::WorkerClosed {
                    path: self.origin.clone(),
                    block: self.range.index,
                });
            }
        }
    }

    fn record_served(&self, bytes: usize, waited: bool, from_ram: bool) {
        if waited {
            self.counters.record_missed(bytes);
        } else if from_ram {
            self.counters.record_ram(bytes);
        } else {
            self.counters.record_disk(bytes);
        }
    }

    fn publish(&self) {
        self.progress.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn finish(&self) {
        self.state.lock().closed = true;
        self.finished.store(true, Ordering::Release);
        self.publish();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::remote::InMemorySource;
    use crate::cache::store::InMemoryStore;
    use crate::info::InfoFile;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn context(store: Arc<dyn LocalStore>, buffer_size: u64, ram_buffers: usize) -> WorkerContext {
        WorkerContext {
            store,
            fetch_permits: Arc::new(Semaphore::new(4)),
            infos: Arc::new(InfoRegistry::new()),
            buffer_size,
            ram_buffers,
        }
    }

    fn whole_block(len: u64) -> BlockRange {
        BlockRange {
            index: 0,
            offset: 0,
            length: len,
        }
    }

    async fn wait_finished(worker: &BlockWorker) {
        for _ in 0..200 {
            if worker.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker did not finish");
    }

    #[tokio::test]
    async fn test_worker_serves_block() {
        let data = pattern(1000);
        let remote = Arc::new(InMemorySource::new("/f", data.clone()));
        let store = Arc::new(InMemoryStore::new());
        let worker = BlockWorker::spawn(
            remote,
            context(store.clone(), 128, 2),
            whole_block(1000),
            PathBuf::from("f___1000_0"),
        );

        let mut buf = vec![0u8; 300];
        assert_eq!(worker.read(&mut buf, 450).await.unwrap(), 300);
        assert_eq!(&buf[..], &data[450..750]);

        wait_finished(&worker).await;
        assert!(worker.is_complete());

        let stored = store
            .read_all(Path::new("f___1000_0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&stored[..], &data[..]);
        let info = InfoFile::load(store.as_ref(), Path::new("f___1000_0.cinfo"))
            .await
            .unwrap();
        assert!(info.is_complete());
        assert_eq!(info.size_in_bits(), 8);
    }

    #[tokio::test]
    async fn test_stats_split_by_source() {
        let data = pattern(400);
        let remote = Arc::new(InMemorySource::new("/f", data.clone()));
        let store = Arc::new(InMemoryStore::new());
        let worker = BlockWorker::spawn(
            remote,
            context(store, 100, 1),
            whole_block(400),
            PathBuf::from("f___400_0"),
        );
        wait_finished(&worker).await;

        // only the last chunk is still held in memory
        let mut buf = vec![0u8; 100];
        assert_eq!(worker.read(&mut buf, 300).await.unwrap(), 100);
        assert_eq!(&buf[..], &data[300..400]);
        assert_eq!(worker.read(&mut buf, 0).await.unwrap(), 100);
        assert_eq!(&buf[..], &data[0..100]);

        let stats = worker.stats();
        assert_eq!(stats.bytes_ram, 100);
        assert_eq!(stats.bytes_disk, 100);
        assert_eq!(stats.bytes_missed, 0);
    }

    #[tokio::test]
    async fn test_resume_skips_present_chunks() {
        let data = pattern(300);
        let store: Arc<dyn LocalStore> = Arc::new(InMemoryStore::new());
        let first = BlockWorker::spawn(
            Arc::new(InMemorySource::new("/f", data.clone())),
            context(store.clone(), 100, 0),
            whole_block(300),
            PathBuf::from("f___300_0"),
        );
        wait_finished(&first).await;
        first.shutdown().await;

        let remote = Arc::new(InMemorySource::new("/f", data.clone()));
        let second = BlockWorker::spawn(
            remote.clone(),
            context(store.clone(), 100, 0),
            whole_block(300),
            PathBuf::from("f___300_0"),
        );
        wait_finished(&second).await;
        assert_eq!(remote.reads(), 0);

        let mut buf = vec![0u8; 300];
        assert_eq!(second.read(&mut buf, 0).await.unwrap(), 300);
        assert_eq!(buf, data);
        assert_eq!(second.stats().bytes_disk, 300);

        let stats = second.shutdown().await;
        assert_eq!(stats.bytes_disk, 300);
        let info = InfoFile::load(store.as_ref(), Path::new("f___300_0.cinfo"))
            .await
            .unwrap();
        assert_eq!(info.access_count(), 2);
    }

    #[tokio::test]
    async fn test_initiate_close_reports_activity() {
        let remote = Arc::new(InMemorySource::new("/f", pattern(64)));
        let worker = BlockWorker::spawn(
            remote,
            context(Arc::new(InMemoryStore::new()), 8, 0),
            whole_block(64),
            PathBuf::from("f___64_0"),
        );
        worker.shutdown().await;
        assert!(worker.is_finished());
        assert!(!worker.initiate_close());
        assert!(!worker.initiate_close());
    }

    #[tokio::test]
    async fn test_read_outside_block_rejected() {
        let remote = Arc::new(InMemorySource::new("/f", pattern(200)));
        let worker = BlockWorker::spawn(
            remote,
            context(Arc::new(InMemoryStore::new()), 50, 0),
            BlockRange {
                index: 1,
                offset: 100,
                length: 100,
            },
            PathBuf::from("f___100_100"),
        );
        let mut buf = vec![0u8; 10];
        assert_matches!(worker.read(&mut buf, 95).await, Err(Error::Internal(_)));
        assert_matches!(worker.read(&mut buf, 195).await, Err(Error::Internal(_)));
        assert_eq!(worker.read(&mut buf, 190).await.unwrap(), 10);
    }
}
