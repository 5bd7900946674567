//! Access Statistics
//!
//! Per-worker byte counters and the cache-wide aggregate they are merged into
//! when a file is detached.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bytes served by one worker, split by where they came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    /// Bytes read back from the local block file
    pub bytes_disk: u64,
    /// Bytes served from in-memory buffers of recently fetched chunks
    pub bytes_ram: u64,
    /// Bytes the reader had to wait on a remote fetch for
    pub bytes_missed: u64,
}

impl AccessStats {
    /// Add another record into this one
    pub fn add(&mut self, other: &AccessStats) {
        self.bytes_disk += other.bytes_disk;
        self.bytes_ram += other.bytes_ram;
        self.bytes_missed += other.bytes_missed;
    }

    /// Total bytes served
    pub fn total(&self) -> u64 {
        self.bytes_disk + self.bytes_ram + self.bytes_missed
    }
}

/// Live counters a worker updates while serving reads
#[derive(Debug, Default)]
pub(crate) struct AccessCounters {
    bytes_disk: AtomicU64,
    bytes_ram: AtomicU64,
    bytes_missed: AtomicU64,
}

impl AccessCounters {
    pub(crate) fn record_disk(&self, bytes: usize) {
        self.bytes_disk.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_ram(&self, bytes: usize) {
        self.bytes_ram.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_missed(&self, bytes: usize) {
        self.bytes_missed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AccessStats {
        AccessStats {
            bytes_disk: self.bytes_disk.load(Ordering::Relaxed),
            bytes_ram: self.bytes_ram.load(Ordering::Relaxed),
            bytes_missed: self.bytes_missed.load(Ordering::Relaxed),
        }
    }
}

/// Cache-wide statistics aggregated over every detached file
#[derive(Debug, Default)]
pub struct CacheStats {
    bytes_disk: AtomicU64,
    bytes_ram: AtomicU64,
    bytes_missed: AtomicU64,
    files_attached: AtomicU64,
    files_detached: AtomicU64,
    workers_created: AtomicU64,
}

impl CacheStats {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one worker's statistics
    pub fn add(&self, stats: &AccessStats) {
        self.bytes_disk.fetch_add(stats.bytes_disk, Ordering::Relaxed);
        self.bytes_ram.fetch_add(stats.bytes_ram, Ordering::Relaxed);
        self.bytes_missed
            .fetch_add(stats.bytes_missed, Ordering::Relaxed);
    }

    pub(crate) fn record_attach(&self) {
        self.files_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_detach(&self) {
        self.files_detached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_created(&self) {
        self.workers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            access: AccessStats {
                bytes_disk: self.bytes_disk.load(Ordering::Relaxed),
                bytes_ram: self.bytes_ram.load(Ordering::Relaxed),
                bytes_missed: self.bytes_missed.load(Ordering::Relaxed),
            },
            files_attached: self.files_attached.load(Ordering::Relaxed),
            files_detached: self.files_detached.load(Ordering::Relaxed),
            workers_created: self.workers_created.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Merged byte counters
    pub access: AccessStats,
    /// Files attached since the cache was created
    pub files_attached: u64,
    /// Files detached since the cache was created
    pub files_detached: u64,
    /// Block workers created since the cache was created
    pub workers_created: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of served bytes that did not need a remote fetch
    pub fn hit_ratio(&self) -> f64 {
        let total = self.access.total() as f64;
        if total == 0.0 {
            0.0
        } else {
            (self.access.bytes_disk + self.access.bytes_ram) as f64 / total
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_stats_add() {
        let mut a = AccessStats {
            bytes_disk: 10,
            bytes_ram: 5,
            bytes_missed: 1,
        };
        a.add(&AccessStats {
            bytes_disk: 1,
            bytes_ram: 2,
            bytes_missed: 3,
        });
        assert_eq!(a.bytes_disk, 11);
        assert_eq!(a.bytes_ram, 7);
        assert_eq!(a.bytes_missed, 4);
        assert_eq!(a.total(), 22);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = AccessCounters::default();
        counters.record_disk(100);
        counters.record_ram(20);
        counters.record_missed(7);
        counters.record_missed(3);

        let snap = counters.snapshot();
        assert_eq!(snap.bytes_disk, 100);
        assert_eq!(snap.bytes_ram, 20);
        assert_eq!(snap.bytes_missed, 10);
    }

    #[test]
    fn test_cache_stats_merge_and_ratio() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_ratio(), 0.0);

        stats.add(&AccessStats {
            bytes_disk: 50,
            bytes_ram: 25,
            bytes_missed: 25,
        });
        stats.record_attach();
        stats.record_detach();

        let snap = stats.snapshot();
        assert_eq!(snap.access.total(), 100);
        assert_eq!(snap.files_attached, 1);
        assert_eq!(snap.files_detached, 1);
        assert_eq!(snap.hit_ratio(), 0.75);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = CacheStats::new().snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"bytes_missed\":0"));
        assert!(json.contains("\"workers_created\":0"));
    }
}
