//! Cache Manager - Block Cache Factory
//!
//! Owns the configuration, local store and fetch pool shared by every open
//! file, hands out a [`BlockCache`] per attached remote file, and collects
//! their statistics when they are detached.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::block::BlockCache;
use super::config::CacheConfig;
use super::path::{block_size_from_path, block_size_hint_text, local_path_for};
use super::remote::RemoteSource;
use super::stats::{AccessStats, CacheStats, CacheStatsSnapshot};
use super::store::{LocalFsStore, LocalStore};
use super::worker::WorkerContext;
use crate::error::{Error, Result};
use crate::info::InfoRegistry;

pub(crate) struct CacheInner {
    config: CacheConfig,
    store: Arc<dyn LocalStore>,
    fetch_permits: Arc<Semaphore>,
    /// One live `.cinfo` writer per block file, shared across handles
    infos: Arc<InfoRegistry>,
    pub(crate) stats: CacheStats,
    /// Open block caches per remote path
    attached: DashMap<String, usize>,
}

impl CacheInner {
    /// Called by a detaching [`BlockCache`]
    pub(crate) fn release(&self, path: &str, stats: &AccessStats) {
        self.stats.add(stats);
        self.stats.record_detach();
        let remaining = match self.attached.get_mut(path) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.attached.remove_if(path, |_, count| *count == 0);
        }
        info!("Released {} ({} handles remain)", path, remaining);
    }
}

/// Block cache factory
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Cache {
    /// Create a cache persisting through `store`
    pub fn new(config: CacheConfig, store: Arc<dyn LocalStore>) -> Result<Self> {
        config.validate()?;
        info!(
            "Block cache: root={} block_size={} buffer_size={} ram_buffers={} fetch_pool={} user={}",
            config.local_root.display(),
            config.block_size,
            config.buffer_size,
            config.ram_buffers,
            config.max_concurrent_fetches,
            config.user
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                fetch_permits: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
                infos: Arc::new(InfoRegistry::new()),
                config,
                store,
                stats: CacheStats::new(),
                attached: DashMap::new(),
            }),
        })
    }

    /// Create a cache persisting under `config.local_root` on the local filesystem
    pub fn with_local_root(config: CacheConfig) -> Result<Self> {
        let store = Arc::new(LocalFsStore::new(config.local_root.clone()));
        Self::new(config, store)
    }

    /// Block size for a remote path: its `hdfsbsize=` hint, else the default
    pub fn block_size_for(&self, path: &str) -> Result<u64> {
        match block_size_from_path(path) {
            Some(0) => Err(Error::InvalidBlockSize {
                path: path.to_string(),
                value: block_size_hint_text(path).to_string(),
            }),
            Some(size) => Ok(size),
            None => Ok(self.inner.config.block_size),
        }
    }

    /// Open a block cache in front of `remote`
    pub fn attach(&self, remote: Arc<dyn RemoteSource>) -> Result<BlockCache> {
        let path = remote.path().to_string();
        let block_size = self.block_size_for(&path)?;
        let local_base = local_path_for(&path)?;

        debug!(
            "Attaching {} (size {}, block size {}) as {}",
            path,
            remote.fsize(),
            block_size,
            local_base.display()
        );

        let ctx = WorkerContext {
            store: self.inner.store.clone(),
            fetch_permits: self.inner.fetch_permits.clone(),
            infos: self.inner.infos.clone(),
            buffer_size: self.inner.config.buffer_size.min(block_size),
            ram_buffers: self.inner.config.ram_buffers,
        };
        *self.inner.attached.entry(path).or_insert(0) += 1;
        self.inner.stats.record_attach();

        Ok(BlockCache::new(
            remote,
            local_base,
            block_size,
            ctx,
            self.inner.clone(),
        ))
    }

    /// True while at least one block cache for `path` is open
    pub fn is_attached(&self, path: &str) -> bool {
        self.inner.attached.contains_key(path)
    }

    /// Number of distinct remote paths currently open
    pub fn attached_count(&self) -> usize {
        self.inner.attached.len()
    }

    /// Snapshot of cache-wide statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Local store
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemorySource, InMemoryStore};
    use assert_matches::assert_matches;

    fn cache() -> Cache {
        let config = CacheConfig {
            block_size: 4096,
            buffer_size: 1024,
            ..Default::default()
        };
        Cache::new(config, Arc::new(InMemoryStore::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            max_concurrent_fetches: 0,
            ..Default::default()
        };
        assert_matches!(
            Cache::new(config, Arc::new(InMemoryStore::new())),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_block_size_resolution() {
        let cache = cache();
        assert_eq!(cache.block_size_for("/data/f").unwrap(), 4096);
        assert_eq!(
            cache.block_size_for("/data/f?hdfsbsize=65536&x=1").unwrap(),
            65536
        );
        assert_matches!(
            cache.block_size_for("/data/f?hdfsbsize=lots"),
            Err(Error::InvalidBlockSize { value, .. }) if value == "lots"
        );
    }

    #[tokio::test]
    async fn test_attach_uses_path_hint() {
        let cache = cache();
        let remote = Arc::new(InMemorySource::new(
            "root://host//store/f.root?hdfsbsize=512",
            vec![0u8; 2000],
        ));
        let file = cache.attach(remote).unwrap();
        assert_eq!(file.block_size(), 512);
        assert_eq!(file.block_count(), 4);
        assert_eq!(file.local_base(), std::path::Path::new("store/f.root"));
        assert!(cache.is_attached("root://host//store/f.root?hdfsbsize=512"));
        assert_eq!(cache.stats().files_attached, 1);
    }

    #[tokio::test]
    async fn test_attach_rejects_zero_hint() {
        let cache = cache();
        let remote = Arc::new(InMemorySource::new("/f?hdfsbsize=0", vec![0u8; 10]));
        assert_matches!(cache.attach(remote), Err(Error::InvalidBlockSize { .. }));
        assert_eq!(cache.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_attach_counts_per_path() {
        let cache = cache();
        let a = cache
            .attach(Arc::new(InMemorySource::new("/f", vec![1u8; 10])))
            .unwrap();
        let b = cache
            .attach(Arc::new(InMemorySource::new("/f", vec![1u8; 10])))
            .unwrap();
        assert_eq!(cache.attached_count(), 1);

        a.detach().await;
        assert!(cache.is_attached("/f"));
        b.detach().await;
        assert!(!cache.is_attached("/f"));
        assert_eq!(cache.stats().files_detached, 2);
    }

    #[tokio::test]
    async fn test_handles_on_one_path_share_history() {
        let store = Arc::new(InMemoryStore::new());
        let config = CacheConfig {
            block_size: 4096,
            buffer_size: 1024,
            ..Default::default()
        };
        let cache = Cache::new(config, store.clone()).unwrap();
        let data = vec![3u8; 6000];
        let a = cache
            .attach(Arc::new(InMemorySource::new("/f", data.clone())))
            .unwrap();
        let b = cache
            .attach(Arc::new(InMemorySource::new("/f", data.clone())))
            .unwrap();

        let mut buf = vec![0u8; 10];
        assert_eq!(a.read(&mut buf, 0).await.unwrap(), 10);
        assert_eq!(b.read(&mut buf, 2000).await.unwrap(), 10);
        a.detach().await;
        b.detach().await;

        let info = crate::info::InfoFile::load(
            store.as_ref(),
            std::path::Path::new("f___4096_0.cinfo"),
        )
        .await
        .unwrap();
        assert_eq!(info.access_count(), 2);
        assert!(info.test_bit(0));
        assert!(info.test_bit(1));
        assert_eq!(cache.inner.infos.live_count().await, 0);
    }
}
