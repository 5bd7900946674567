//! Cache Configuration
//!
//! Explicit configuration handed to the [`Cache`](super::Cache) factory. Can be
//! built in code or loaded from a YAML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for block files and their `.cinfo` records
    pub local_root: PathBuf,
    /// Block size used when a path carries no `hdfsbsize=` hint
    pub block_size: u64,
    /// Fetch unit inside a block, and presence bitmap granularity
    pub buffer_size: u64,
    /// Recently fetched chunks each worker keeps in memory
    pub ram_buffers: usize,
    /// Chunk fetches allowed in flight across all workers
    pub max_concurrent_fetches: usize,
    /// Identity used for local store access
    pub user: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("/var/cache/blockcache"),
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ram_buffers: 8,
            max_concurrent_fetches: 16,
            user: "nobody".to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".to_string()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Config(
                "max_concurrent_fetches must be positive".to_string(),
            ));
        }
        if self.local_root.as_os_str().is_empty() {
            return Err(Error::Config("local_root must not be empty".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
