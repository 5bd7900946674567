//! Cache Info - Persisted Per-File Cache Metadata
//!
//! Each cached file has a companion `.cinfo` record holding the fetch unit
//! size, a presence bitmap with one bit per fetch unit, and an append-only
//! history of access statistics written when the file is detached.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! ┌─────────┬─────────────┬────────┬──────────────────┬──────────────┬───────────────────┐
//! │ version │ buffer_size │ n_bits │ bitmap           │ access_count │ records           │
//! │ i32     │ i64         │ i32    │ ceil(n_bits / 8) │ i32          │ 32 bytes × count  │
//! └─────────┴─────────────┴────────┴──────────────────┴──────────────┴───────────────────┘
//! ```
//!
//! A record is `detach_time` (unix seconds), `bytes_disk`, `bytes_ram` and
//! `bytes_missed`, each an i64. Bit `i` lives in byte `i / 8` under mask
//! `1 << (i % 8)`.

mod file;

pub(crate) use file::InfoRegistry;
pub use file::InfoFile;

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::AccessStats;
use crate::error::{Error, Result};

/// File name suffix of cache info records
pub const INFO_EXTENSION: &str = ".cinfo";

/// Format version written by this crate
pub const INFO_VERSION: i32 = 1;

/// Size of the fixed header preceding the bitmap
pub const HEADER_SIZE: usize = 4 + 8 + 4;

/// Size of one encoded access record
pub const ACCESS_RECORD_SIZE: usize = 32;

/// One entry of the access history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AccessRecord {
    /// Detach time in seconds since the unix epoch
    pub detach_time: i64,
    /// Bytes served from the local block file
    pub bytes_disk: i64,
    /// Bytes served from in-memory buffers
    pub bytes_ram: i64,
    /// Bytes that had to be fetched from the remote source
    pub bytes_missed: i64,
}

impl AccessRecord {
    /// Build a record from worker statistics
    pub fn new(detach_time: i64, stats: &AccessStats) -> Self {
        Self {
            detach_time,
            bytes_disk: stats.bytes_disk as i64,
            bytes_ram: stats.bytes_ram as i64,
            bytes_missed: stats.bytes_missed as i64,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.detach_time.to_le_bytes());
        out.extend_from_slice(&self.bytes_disk.to_le_bytes());
        out.extend_from_slice(&self.bytes_ram.to_le_bytes());
        out.extend_from_slice(&self.bytes_missed.to_le_bytes());
    }

    /// Encode this record into its fixed 32-byte form
    pub fn encode(&self) -> [u8; ACCESS_RECORD_SIZE] {
        let mut buf = Vec::with_capacity(ACCESS_RECORD_SIZE);
        self.encode_into(&mut buf);
        let mut out = [0u8; ACCESS_RECORD_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            detach_time: cursor.i64()?,
            bytes_disk: cursor.i64()?,
            bytes_ram: cursor.i64()?,
            bytes_missed: cursor.i64()?,
        })
    }
}

/// In-memory form of a cache info record
///
/// The bitmap is held as atomic bytes, so [`CacheInfo::mark_present`] may run
/// concurrently with readers without tearing a byte.
#[derive(Debug)]
pub struct CacheInfo {
    version: i32,
    buffer_size: u64,
    n_bits: u32,
    bitmap: Box<[AtomicU8]>,
    history: RwLock<Vec<AccessRecord>>,
}

impl CacheInfo {
    /// Create an empty record covering `file_size` bytes at `buffer_size` granularity
    pub fn new(buffer_size: u64, file_size: u64) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::Config("buffer size must be positive".to_string()));
        }
        let n_bits = file_size.div_ceil(buffer_size);
        let n_bits = u32::try_from(n_bits)
            .ok()
            .filter(|n| *n <= i32::MAX as u32)
            .ok_or_else(|| {
                Error::Config(format!(
                    "file size {} needs too many {}-byte chunks",
                    file_size, buffer_size
                ))
            })?;
        Ok(Self::with_bits(INFO_VERSION, buffer_size, n_bits))
    }

    fn with_bits(version: i32, buffer_size: u64, n_bits: u32) -> Self {
        let n_bytes = (n_bits as usize).div_ceil(8);
        Self {
            version,
            buffer_size,
            n_bits,
            bitmap: (0..n_bytes).map(|_| AtomicU8::new(0)).collect(),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Format version of this record
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Fetch unit the bitmap is quantized to
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Number of bits (fetch units) in the bitmap
    pub fn size_in_bits(&self) -> u32 {
        self.n_bits
    }

    /// Number of bytes the packed bitmap occupies
    pub fn size_in_bytes(&self) -> usize {
        self.bitmap.len()
    }

    /// Set the presence bit for one fetch unit. Idempotent.
    pub fn mark_present(&self, index: u32) {
        if index >= self.n_bits {
            return;
        }
        let (byte, mask) = Self::locate(index);
        self.bitmap[byte].fetch_or(mask, Ordering::Release);
    }

    /// Test the presence bit of one fetch unit
    pub fn test_bit(&self, index: u32) -> bool {
        if index >= self.n_bits {
            return false;
        }
        let (byte, mask) = Self::locate(index);
        self.bitmap[byte].load(Ordering::Acquire) & mask != 0
    }

    /// Current value of the bitmap byte holding `index`
    pub fn bitmap_byte(&self, index: u32) -> u8 {
        let (byte, _) = Self::locate(index);
        self.bitmap
            .get(byte)
            .map(|b| b.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of set bits
    pub fn count_present(&self) -> u32 {
        (0..self.n_bits).filter(|i| self.test_bit(*i)).count() as u32
    }

    /// True iff every bit is set
    pub fn is_complete(&self) -> bool {
        (0..self.n_bits).all(|i| self.test_bit(i))
    }

    /// Indices of all set bits, ascending
    pub fn present_indices(&self) -> Vec<u32> {
        (0..self.n_bits).filter(|i| self.test_bit(*i)).collect()
    }

    /// Append one access record. The history is never rewritten.
    pub fn append_access(&self, record: AccessRecord) {
        self.history.write().push(record);
    }

    /// Number of access records
    pub fn access_count(&self) -> usize {
        self.history.read().len()
    }

    /// Snapshot of the access history
    pub fn access_records(&self) -> Vec<AccessRecord> {
        self.history.read().clone()
    }

    /// Byte offset of the bitmap byte holding `index`
    pub fn bitmap_offset(index: u32) -> u64 {
        (HEADER_SIZE + index as usize / 8) as u64
    }

    /// Byte offset of the access count field
    pub fn access_count_offset(&self) -> u64 {
        (HEADER_SIZE + self.size_in_bytes()) as u64
    }

    /// Byte offset of access record `n`
    pub fn access_record_offset(&self, n: usize) -> u64 {
        self.access_count_offset() + 4 + (n * ACCESS_RECORD_SIZE) as u64
    }

    /// Encode the whole record
    pub fn encode(&self) -> Vec<u8> {
        let history = self.history.read();
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.size_in_bytes() + 4 + history.len() * ACCESS_RECORD_SIZE,
        );
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.buffer_size as i64).to_le_bytes());
        out.extend_from_slice(&(self.n_bits as i32).to_le_bytes());
        out.extend(self.bitmap.iter().map(|b| b.load(Ordering::Acquire)));
        out.extend_from_slice(&(history.len() as i32).to_le_bytes());
        for record in history.iter() {
            record.encode_into(&mut out);
        }
        out
    }

    /// Decode a record, rejecting unknown versions and truncated input
    ///
    /// Bytes past the last counted access record are ignored, which is what a
    /// reader racing an append observes before the count is bumped.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor.i32()?;
        if version != INFO_VERSION {
            return Err(Error::UnsupportedInfoVersion {
                found: version,
                expected: INFO_VERSION,
            });
        }
        let buffer_size = cursor.i64()?;
        if buffer_size <= 0 {
            return Err(Error::InfoFormat(format!(
                "non-positive buffer size {}",
                buffer_size
            )));
        }
        let n_bits = cursor.i32()?;
        if n_bits < 0 {
            return Err(Error::InfoFormat(format!("negative bit count {}", n_bits)));
        }

        // Bound the bitmap by the input before allocating it
        let packed = cursor.take((n_bits as usize).div_ceil(8))?;
        let info = Self::with_bits(version, buffer_size as u64, n_bits as u32);
        for (slot, byte) in info.bitmap.iter().zip(packed) {
            slot.store(*byte, Ordering::Relaxed);
        }

        let count = cursor.i32()?;
        if count < 0 {
            return Err(Error::InfoFormat(format!("negative access count {}", count)));
        }
        {
            let mut history = info.history.write();
            for _ in 0..count {
                history.push(AccessRecord::decode(&mut cursor)?);
            }
        }
        Ok(info)
    }

    fn locate(index: u32) -> (usize, u8) {
        ((index / 8) as usize, 1u8 << (index % 8))
    }
}

/// Little-endian reader over a byte slice
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::InfoFormat(format!(
                "truncated record: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.bytes.len()
            ))),
        }
    }

    fn i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }
}

// =============================================================================
// Tests
// =============================================================================
