#![forbid(unsafe_code)]
//! The value log: an append-only file of `(length, key, value)` records.
//!
//! Records are written once at journal commit and never rewritten. Offsets
//! handed to the tree point at the record start; the length stored in a node
//! slot is the total record length including this header.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::key::{Key, KEY_BYTES};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{EstriaError, Result};

/// Bytes preceding the value payload: record length plus the key.
pub const VALUE_HEADER_LEN: usize = 8 + KEY_BYTES;

/// Read granularity for sequential scans.
const SCAN_CHUNK: usize = 64 * 1024;

/// Total on-disk length of a record holding `value_len` payload bytes.
pub fn record_len(value_len: usize) -> u64 {
    (VALUE_HEADER_LEN + value_len) as u64
}

pub trait ValueStore: Send + Sync {
    /// Reads the value portion of the record at `offset` whose total length
    /// is `length`.
    fn get(&self, offset: u64, length: u32) -> Result<Vec<u8>>;
    /// Writes one record at the offset already assigned to it.
    fn set(&self, key: &Key, offset: u64, value: &[u8]) -> Result<()>;
    /// Streams `(key_bytes, value_bytes)` for every record in insertion
    /// order.
    fn each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()>;
    /// Total bytes of committed records. Monotonically increasing.
    fn size(&self) -> u64;
    fn sync(&self) -> Result<()>;
    /// Drops every record. Not thread-safe.
    fn clear(&self) -> Result<()>;
}

fn check_record_length(length: u64) -> Result<usize> {
    if length <= VALUE_HEADER_LEN as u64 {
        return Err(EstriaError::Corruption("value record shorter than header"));
    }
    if length > VALUE_HEADER_LEN as u64 + u32::MAX as u64 {
        return Err(EstriaError::Corruption("value record length implausible"));
    }
    Ok(length as usize)
}

pub struct FileValueStore {
    io: StdFileIo,
    size: AtomicU64,
}

impl FileValueStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        let size = io.len()?;
        Ok(Self {
            io,
            size: AtomicU64::new(size),
        })
    }
}

impl ValueStore for FileValueStore {
    fn get(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let length = check_record_length(length as u64)?;
        let mut value = vec![0u8; length - VALUE_HEADER_LEN];
        let read = self.io.read_at(offset + VALUE_HEADER_LEN as u64, &mut value)?;
        if read == 0 {
            return Err(EstriaError::ValueNotFound);
        }
        if read < value.len() {
            return Err(EstriaError::ShortRead);
        }
        Ok(value)
    }

    fn set(&self, key: &Key, offset: u64, value: &[u8]) -> Result<()> {
        let length = record_len(value.len());
        let mut record = Vec::with_capacity(length as usize);
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(&key.to_bytes());
        record.extend_from_slice(value);
        self.io.write_all_at(offset, &record)?;
        self.size.fetch_max(offset + length, Ordering::SeqCst);
        Ok(())
    }

    fn each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let total = self.size();
        let mut chunk = vec![0u8; SCAN_CHUNK];
        let mut pos = 0u64;
        'refill: while pos < total {
            let want = chunk.len().min((total - pos) as usize);
            let read = self.io.read_at(pos, &mut chunk[..want])?;
            if read < 8 {
                return Err(EstriaError::Corruption("value log truncated mid-record"));
            }
            let mut off = 0usize;
            while off + 8 <= read {
                let length = u64::from_le_bytes(chunk[off..off + 8].try_into().expect("8 bytes"));
                let length = check_record_length(length)?;
                let end = off + length;
                if end > read {
                    if off == 0 {
                        // A single record larger than the chunk; read it
                        // directly.
                        let mut record = vec![0u8; length];
                        self.io.read_exact_at(pos, &mut record)?;
                        f(
                            &record[8..VALUE_HEADER_LEN],
                            &record[VALUE_HEADER_LEN..],
                        )?;
                        pos += length as u64;
                        continue 'refill;
                    }
                    // Straddles the chunk boundary; re-read from its start.
                    break;
                }
                f(
                    &chunk[off + 8..off + VALUE_HEADER_LEN],
                    &chunk[off + VALUE_HEADER_LEN..end],
                )?;
                off = end;
            }
            if off == 0 {
                return Err(EstriaError::Corruption("value log truncated mid-record"));
            }
            pos += off as u64;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn clear(&self) -> Result<()> {
        self.io.truncate(0)?;
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory backend mirroring the file layout's offset discipline, for
/// tests and ephemeral stores.
pub struct MemoryValueStore {
    records: Mutex<BTreeMap<u64, (Key, Vec<u8>)>>,
    size: AtomicU64,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            size: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore for MemoryValueStore {
    fn get(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let length = check_record_length(length as u64)?;
        let records = self.records.lock();
        let (_, value) = records.get(&offset).ok_or(EstriaError::ValueNotFound)?;
        if value.len() + VALUE_HEADER_LEN != length {
            return Err(EstriaError::ShortRead);
        }
        Ok(value.clone())
    }

    fn set(&self, key: &Key, offset: u64, value: &[u8]) -> Result<()> {
        let length = record_len(value.len());
        self.records.lock().insert(offset, (*key, value.to_vec()));
        self.size.fetch_max(offset + length, Ordering::SeqCst);
        Ok(())
    }

    fn each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let records = self.records.lock();
        for (key, value) in records.values() {
            f(&key.to_bytes(), value)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }
}
