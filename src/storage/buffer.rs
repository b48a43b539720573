#![forbid(unsafe_code)]
//! Staging area for writes between `put` and flush.
//!
//! Every entry is keyed by its key and also indexed by
//! `(status, offset, key)` so one status class can be scanned in offset
//! order. A single mutex protects the whole structure; `commit` is the only
//! operation that releases it between batches.
//!
//! Status flow: `Unprocessed` entries are fresh puts. When a flush places
//! one in a node it becomes `NeedsCommitting` with an assigned value-file
//! offset, then `Committed` once the record is on disk. Keys displaced out
//! of an existing node slot re-enter as `Evicted`, carrying only their
//! on-disk offset and length, until the same flush routes them into a child
//! node. `purge` drops the evicted and committed residue at flush end.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::Excluded;

use parking_lot::Mutex;

use crate::key::Key;
use crate::storage::node::KeyValue;
use crate::storage::values::{record_len, ValueStore};
use crate::types::{EstriaError, Result};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Status {
    Unprocessed,
    Evicted,
    NeedsCommitting,
    Committed,
}

#[derive(Clone, Debug)]
struct Entry {
    status: Status,
    offset: u64,
    length: u32,
    value: Vec<u8>,
}

#[derive(Default)]
struct BufferInner {
    entries: BTreeMap<Key, Entry>,
    by_status: BTreeSet<(Status, u64, Key)>,
}

/// Counts of entries per status, for flush logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusCounts {
    pub unprocessed: usize,
    pub evicted: usize,
    pub needs_committing: usize,
    pub committed: usize,
}

#[derive(Default)]
pub struct WriteBuffer {
    inner: Mutex<BufferInner>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the staged value for `key`, unless the entry is an evictee
    /// (whose value lives only on disk).
    pub fn get(&self, key: &Key) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        if entry.status == Status::Evicted {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Stages a fresh write. A key already resident keeps its first value;
    /// the colliding put is dropped. Returns the buffer size.
    pub fn add(&self, key: Key, value: Vec<u8>) -> usize {
        debug_assert!(record_len(value.len()) <= u32::MAX as u64);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.entries.contains_key(&key) {
            let length = record_len(value.len()) as u32;
            inner.by_status.insert((Status::Unprocessed, 0, key));
            inner.entries.insert(
                key,
                Entry {
                    status: Status::Unprocessed,
                    offset: 0,
                    length,
                    value,
                },
            );
        }
        inner.entries.len()
    }

    /// Re-stages a key displaced out of a node slot. The value already lives
    /// at `(offset, length)` in the value file. An unprocessed put for the
    /// same key is dropped: the key exists on disk, so that put is a
    /// duplicate.
    pub fn add_evictee(&self, key: Key, offset: u64, length: u32) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get(&key) {
            if entry.status != Status::Unprocessed {
                return Err(EstriaError::BadCommit("evictee already buffered"));
            }
            inner.by_status.remove(&(entry.status, entry.offset, key));
            inner.entries.remove(&key);
        }
        inner.by_status.insert((Status::Evicted, offset, key));
        inner.entries.insert(
            key,
            Entry {
                status: Status::Evicted,
                offset,
                length,
                value: Vec::new(),
            },
        );
        Ok(inner.entries.len())
    }

    /// Assigns a value-file offset to an unprocessed entry, moving it to
    /// `NeedsCommitting`. Returns the offset and total record length for the
    /// node slot.
    pub fn set_offset(&self, key: &Key, offset: u64) -> Result<(u64, u32)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner
            .entries
            .get_mut(key)
            .ok_or(EstriaError::BadCommit("offset assigned to absent key"))?;
        if entry.status != Status::Unprocessed {
            return Err(EstriaError::BadCommit("offset assigned twice"));
        }
        inner.by_status.remove(&(entry.status, entry.offset, *key));
        entry.status = Status::NeedsCommitting;
        entry.offset = offset;
        inner.by_status.insert((entry.status, entry.offset, *key));
        Ok((entry.offset, entry.length))
    }

    /// Drops a staged put whose key already exists in the tree.
    pub fn remove_duplicate(&self, key: &Key) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner
            .entries
            .remove(key)
            .ok_or(EstriaError::BadCommit("duplicate already removed"))?;
        inner.by_status.remove(&(entry.status, entry.offset, *key));
        Ok(())
    }

    /// Persists every `NeedsCommitting` entry through `values`, marking each
    /// `Committed`. At most `batch_size` entries are handled per lock
    /// acquisition; the mutex is released between batches so readers and
    /// writers can interleave.
    pub fn commit(&self, values: &dyn ValueStore, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(EstriaError::Invalid("commit batch size must be positive"));
        }
        let lo = (Status::NeedsCommitting, 0u64, Key::ZERO);
        let hi = (Status::NeedsCommitting, u64::MAX, Key::MAX);
        loop {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let batch: Vec<(Key, u64)> = inner
                .by_status
                .range(lo..=hi)
                .take(batch_size)
                .map(|&(_, offset, key)| (key, offset))
                .collect();
            if batch.is_empty() {
                return Ok(());
            }
            for (key, offset) in &batch {
                let entry = inner
                    .entries
                    .get_mut(key)
                    .ok_or(EstriaError::BadCommit("committing entry vanished"))?;
                values.set(key, *offset, &entry.value)?;
                inner
                    .by_status
                    .remove(&(Status::NeedsCommitting, *offset, *key));
                entry.status = Status::Committed;
                inner.by_status.insert((Status::Committed, *offset, *key));
            }
            if batch.len() < batch_size {
                return Ok(());
            }
        }
    }

    /// Removes all evicted and committed entries. Unprocessed survivors stay
    /// for the next flush. Fails if any entry still needs committing.
    pub fn purge(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let lo = (Status::NeedsCommitting, 0u64, Key::ZERO);
        let hi = (Status::NeedsCommitting, u64::MAX, Key::MAX);
        if inner.by_status.range(lo..=hi).next().is_some() {
            return Err(EstriaError::BadCommit("purge with uncommitted entries"));
        }
        inner.entries.retain(|_, entry| {
            matches!(entry.status, Status::Unprocessed | Status::NeedsCommitting)
        });
        inner
            .by_status
            .retain(|&(status, _, _)| {
                matches!(status, Status::Unprocessed | Status::NeedsCommitting)
            });
        Ok(())
    }

    /// Collects the unprocessed keys (candidates, with their record lengths)
    /// and evicted keys strictly inside `(first, last)`.
    pub fn get_candidates(
        &self,
        first: &Key,
        last: &Key,
        candidates: &mut Vec<(Key, u32)>,
        evictions: &mut Vec<KeyValue>,
    ) {
        if first >= last {
            return;
        }
        let inner = self.inner.lock();
        for (key, entry) in inner.entries.range((Excluded(*first), Excluded(*last))) {
            match entry.status {
                Status::Unprocessed => candidates.push((*key, entry.length)),
                Status::Evicted => evictions.push(KeyValue {
                    key: *key,
                    offset: entry.offset,
                    length: entry.length,
                }),
                _ => {}
            }
        }
    }

    /// Whether any unprocessed or evicted entry lies strictly inside
    /// `(first, last)`.
    pub fn contains_range(&self, first: &Key, last: &Key) -> Result<bool> {
        if first > last {
            return Err(EstriaError::Invalid("range first above last"));
        }
        if first == last {
            // The open interval is empty; an equal-bound range would also
            // trip BTreeMap's excluded-bound panic.
            return Ok(false);
        }
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range((Excluded(*first), Excluded(*last)))
            .any(|(_, entry)| {
                matches!(entry.status, Status::Unprocessed | Status::Evicted)
            }))
    }

    /// Upper end of the highest offset already assigned to a pending or
    /// committed entry. A flush that failed between assignment and commit
    /// leaves entries above the value store's size counter; fresh
    /// assignments must start past them.
    pub fn assigned_end(&self) -> u64 {
        let inner = self.inner.lock();
        let mut end = 0u64;
        for status in [Status::NeedsCommitting, Status::Committed] {
            let lo = (status, 0u64, Key::ZERO);
            let hi = (status, u64::MAX, Key::MAX);
            if let Some(&(_, offset, key)) = inner.by_status.range(lo..=hi).next_back() {
                if let Some(entry) = inner.entries.get(&key) {
                    end = end.max(offset + entry.length as u64);
                }
            }
        }
        end
    }

    pub fn ready_for_committing(&self) -> usize {
        let inner = self.inner.lock();
        let lo = (Status::NeedsCommitting, 0u64, Key::ZERO);
        let hi = (Status::NeedsCommitting, u64::MAX, Key::MAX);
        inner.by_status.range(lo..=hi).count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();
        for entry in inner.entries.values() {
            match entry.status {
                Status::Unprocessed => counts.unprocessed += 1,
                Status::Evicted => counts.evicted += 1,
                Status::NeedsCommitting => counts.needs_committing += 1,
                Status::Committed => counts.committed += 1,
            }
        }
        counts
    }

    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.entries.clear();
        inner.by_status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::values::MemoryValueStore;

    fn key(n: u64) -> Key {
        Key::from_u64(n)
    }

    #[test]
    fn first_writer_wins_within_residency() {
        let buffer = WriteBuffer::new();
        assert_eq!(buffer.add(key(1), b"first".to_vec()), 1);
        assert_eq!(buffer.add(key(1), b"second".to_vec()), 1);
        assert_eq!(buffer.get(&key(1)).unwrap(), b"first");
    }

    #[test]
    fn evictees_hide_their_values() {
        let buffer = WriteBuffer::new();
        buffer.add_evictee(key(2), 100, 50).unwrap();
        assert_eq!(buffer.get(&key(2)), None);
        assert_eq!(buffer.size(), 1);
        assert!(matches!(
            buffer.add_evictee(key(2), 100, 50),
            Err(EstriaError::BadCommit(_))
        ));
    }

    #[test]
    fn evictee_supersedes_a_racing_put() {
        let buffer = WriteBuffer::new();
        buffer.add(key(4), b"late duplicate".to_vec());
        buffer.add_evictee(key(4), 200, 60).unwrap();
        // The put was dropped; the evictee's on-disk location survives.
        assert_eq!(buffer.get(&key(4)), None);
        assert_eq!(buffer.size(), 1);
        let mut candidates = Vec::new();
        let mut evictions = Vec::new();
        buffer.get_candidates(&key(1), &key(10), &mut candidates, &mut evictions);
        assert!(candidates.is_empty());
        assert_eq!(evictions[0].offset, 200);
    }

    #[test]
    fn offset_assignment_transitions_once() {
        let buffer = WriteBuffer::new();
        buffer.add(key(3), b"payload".to_vec());
        let (offset, length) = buffer.set_offset(&key(3), 4096).unwrap();
        assert_eq!(offset, 4096);
        assert_eq!(length, record_len(7) as u32);
        assert!(matches!(
            buffer.set_offset(&key(3), 8192),
            Err(EstriaError::BadCommit(_))
        ));
        assert!(matches!(
            buffer.set_offset(&key(99), 0),
            Err(EstriaError::BadCommit(_))
        ));
        assert_eq!(buffer.ready_for_committing(), 1);
    }

    #[test]
    fn candidates_and_evictions_respect_open_interval() {
        let buffer = WriteBuffer::new();
        buffer.add(key(10), b"a".to_vec());
        buffer.add(key(20), b"b".to_vec());
        buffer.add(key(30), b"c".to_vec());
        buffer.add_evictee(key(25), 7, 48).unwrap();

        let mut candidates = Vec::new();
        let mut evictions = Vec::new();
        buffer.get_candidates(&key(10), &key(30), &mut candidates, &mut evictions);
        assert_eq!(
            candidates.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            vec![key(20)]
        );
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].key, key(25));
        assert_eq!(evictions[0].offset, 7);
    }

    #[test]
    fn contains_range_is_strict_and_validated() {
        let buffer = WriteBuffer::new();
        buffer.add(key(100), b"x".to_vec());
        assert!(buffer.contains_range(&key(50), &key(150)).unwrap());
        assert!(!buffer.contains_range(&key(100), &key(150)).unwrap());
        assert!(!buffer.contains_range(&key(50), &key(100)).unwrap());
        assert!(!buffer.contains_range(&key(100), &key(100)).unwrap());
        assert!(matches!(
            buffer.contains_range(&key(150), &key(50)),
            Err(EstriaError::Invalid(_))
        ));
    }

    #[test]
    fn committed_entries_do_not_count_toward_ranges() {
        let buffer = WriteBuffer::new();
        let values = MemoryValueStore::new();
        buffer.add(key(5), b"v".to_vec());
        buffer.set_offset(&key(5), 0).unwrap();
        buffer.commit(&values, 16).unwrap();
        assert!(!buffer.contains_range(&key(1), &key(10)).unwrap());
        // The value is still readable from the buffer until purge.
        assert_eq!(buffer.get(&key(5)).unwrap(), b"v");
    }

    #[test]
    fn commit_walks_offset_order_in_batches() {
        let buffer = WriteBuffer::new();
        let values = MemoryValueStore::new();
        let mut offset = 0u64;
        for i in 1..=10u64 {
            let value = format!("value-{i}").into_bytes();
            buffer.add(key(i), value.clone());
            let (_, length) = buffer.set_offset(&key(i), offset).unwrap();
            offset += length as u64;
        }
        buffer.commit(&values, 3).unwrap();
        assert_eq!(buffer.ready_for_committing(), 0);
        assert_eq!(buffer.status_counts().committed, 10);
        assert_eq!(values.size(), offset);

        let mut seen = Vec::new();
        values
            .each(&mut |key_bytes, value| {
                seen.push((key_bytes.to_vec(), value.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0].1, b"value-1");
        assert_eq!(seen[9].1, b"value-10");
    }

    #[test]
    fn purge_keeps_unprocessed_survivors() {
        let buffer = WriteBuffer::new();
        let values = MemoryValueStore::new();
        buffer.add(key(1), b"flushed".to_vec());
        buffer.add(key(2), b"pending".to_vec());
        buffer.add_evictee(key(3), 0, 41).unwrap();
        buffer.set_offset(&key(1), 0).unwrap();

        assert!(matches!(buffer.purge(), Err(EstriaError::BadCommit(_))));
        buffer.commit(&values, 8).unwrap();
        buffer.purge().unwrap();
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.get(&key(2)).unwrap(), b"pending");
        assert_eq!(buffer.get(&key(1)), None);
    }

    #[test]
    fn assigned_end_tracks_pending_offsets() {
        let buffer = WriteBuffer::new();
        assert_eq!(buffer.assigned_end(), 0);
        buffer.add(key(1), b"aa".to_vec());
        buffer.add(key(2), b"bb".to_vec());
        assert_eq!(buffer.assigned_end(), 0);
        buffer.set_offset(&key(1), 0).unwrap();
        let (_, length) = buffer.set_offset(&key(2), 500).unwrap();
        assert_eq!(buffer.assigned_end(), 500 + length as u64);
        // Committing does not lower the mark.
        let values = MemoryValueStore::new();
        buffer.commit(&values, 8).unwrap();
        assert_eq!(buffer.assigned_end(), 500 + length as u64);
    }

    #[test]
    fn remove_duplicate_erases_entry() {
        let buffer = WriteBuffer::new();
        buffer.add(key(9), b"dup".to_vec());
        buffer.remove_duplicate(&key(9)).unwrap();
        assert_eq!(buffer.size(), 0);
        assert!(matches!(
            buffer.remove_duplicate(&key(9)),
            Err(EstriaError::BadCommit(_))
        ));
    }
}
