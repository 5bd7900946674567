//! Block Cache System
//!
//! Accelerates repeated reads of large remote files by caching them block by
//! block on local storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache (factory)                                 │
//! │       config · local store · bounded fetch pool · global stats           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  BlockCache (one per open remote file)                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │ Mutex<BTreeMap<block index, Arc<BlockWorker>>>                    │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! │         │                    │                     │                     │
//! │   BlockWorker 0        BlockWorker 1    ...   BlockWorker N              │
//! │   fetch task ──▶ file___S_0 + .cinfo    fetch task ──▶ file___S_NS       │
//! └──────────────────────────────────────────────────────────────────────────┘
//!            ▲                                          │
//!            └────────── RemoteSource (range reads) ◀───┘
//! ```
//!
//! # Design Principles
//!
//! - A block index always maps to `[i * S, (i + 1) * S)`, clamped at end of file
//! - At most one worker per block per open file
//! - Registry lock held only for lookup-or-insert, never across a read
//! - Cancellation is cooperative: a worker finishes its current chunk first

mod block;
mod config;
mod manager;
mod path;
mod remote;
mod stats;
mod store;
mod worker;

pub use block::BlockCache;
pub use config::CacheConfig;
pub use manager::Cache;
pub use path::{
    block_file_name, block_size_from_path, info_file_name, is_info_file, local_path_for,
    BLOCK_SIZE_TAG,
};
pub use remote::{InMemorySource, LocalFileSource, RemoteSource};
pub use stats::{AccessStats, CacheStats, CacheStatsSnapshot};
pub use store::{InMemoryStore, LocalFsStore, LocalStore, LocalStoreStats};
pub use worker::{BlockRange, BlockWorker};

/// Default block size (128MB)
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Default fetch unit inside a block (1MB)
pub const DEFAULT_BUFFER_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Tests
// =============================================================================
