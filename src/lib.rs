//! Blockcache - Block-Based Local Disk Cache for Remote Files
//!
//! Splits reads of large remote files into fixed-size blocks, fetches each
//! block at most once into a local file, and records per-block completeness
//! and access history in a compact binary metadata file.
//!
//! # Architecture
//!
//! ```text
//! reader ──▶ BlockCache ──▶ BlockWorker(i) ──▶ RemoteSource
//!                               │
//!                               ▼
//!                   LocalStore: <base>___<S>_<offset>
//!                               <base>___<S>_<offset>.cinfo
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Read splitting, block workers, local store and the cache factory
//! - [`error`] - Error types
//! - [`info`] - Binary per-block metadata (`.cinfo`)
//! - [`inspect`] - Read-only reporting over metadata files

pub mod cache;
pub mod error;
pub mod info;
pub mod inspect;

// Re-export commonly used types
pub use cache::{BlockCache, Cache, CacheConfig, LocalFsStore, LocalStore, RemoteSource};
pub use error::{Error, Result};
pub use info::{AccessRecord, CacheInfo, InfoFile};
pub use inspect::{InspectSummary, Inspector};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Tests
// =============================================================================
