#![forbid(unsafe_code)]
//! Copy-on-write mutation of one node within a flush pass.
//!
//! A delta starts clean, pointing at the shared pre-flush snapshot. The
//! first mutation clones that snapshot into a private successor; readers
//! keep descending the old node until the journal commit swaps the cache
//! entry. Placement only runs on childless nodes: a node with children is
//! always full and keeps its keys, so pending entries flow down to the
//! child that owns their subrange.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::key::{nearest_stride, Key};
use crate::storage::buffer::WriteBuffer;
use crate::storage::node::{KeyValue, Node};
use crate::types::{EstriaError, NodeId, Result};

/// Where a combined entry came from, which decides how it is placed and
/// what happens when it loses a slot.
enum Source {
    /// Already in this node; displacement re-stages it as an evictee.
    Existing(KeyValue),
    /// A fresh put; placement assigns its value-file offset.
    Candidate,
    /// Displaced from an ancestor this pass; its record is already on disk.
    Evictee(KeyValue),
}

pub struct Delta {
    previous: Arc<Node>,
    current: Option<Node>,
    existing: u64,
    insertions: u64,
    evictions: u64,
    synthetics: u64,
    children: u64,
}

impl Delta {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            previous: node,
            current: None,
            existing: 0,
            insertions: 0,
            evictions: 0,
            synthetics: 0,
            children: 0,
        }
    }

    pub fn dirty(&self) -> bool {
        self.current.is_some()
    }

    /// The node as this flush sees it: the successor once one exists.
    pub fn current(&self) -> &Node {
        self.current.as_ref().unwrap_or(&self.previous)
    }

    pub fn insertions(&self) -> u64 {
        self.insertions
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn synthetics(&self) -> u64 {
        self.synthetics
    }

    pub fn children_updated(&self) -> u64 {
        self.children
    }

    /// Consumes the delta, yielding the successor if one was built.
    pub fn into_node(self) -> Option<Node> {
        self.current
    }

    pub fn check_sanity(&self) -> Result<()> {
        self.current().check_sane()
    }

    pub fn set_child(&mut self, index: usize, id: NodeId) {
        let mut node = self.take_for_write();
        node.set_child(index, id);
        self.current = Some(node);
        self.children += 1;
    }

    fn take_for_write(&mut self) -> Node {
        self.current
            .take()
            .unwrap_or_else(|| (*self.previous).clone())
    }

    /// Folds the pending candidates and evictions into this node. Duplicate
    /// candidates must already have been dropped by the caller. Fresh
    /// candidates that win a slot get offsets from `next_offset`; existing
    /// keys that lose their slot are re-staged on the buffer as evictees.
    pub(crate) fn add_keys(
        &mut self,
        candidates: Vec<(Key, u32)>,
        evictions: Vec<KeyValue>,
        buffer: &WriteBuffer,
        next_offset: &mut u64,
    ) -> Result<()> {
        debug_assert!(!self.current().has_children());
        let mut combined: BTreeMap<Key, Source> = BTreeMap::new();
        for kv in self.current().real_keys() {
            combined.insert(kv.key, Source::Existing(*kv));
        }
        self.existing = combined.len() as u64;
        for (key, _) in &candidates {
            combined.insert(*key, Source::Candidate);
        }
        for kv in &evictions {
            if combined.insert(kv.key, Source::Evictee(*kv)).is_some() {
                return Err(EstriaError::Corruption(
                    "evicted key already lives in a descendant",
                ));
            }
        }
        if combined.len() as u64 == self.existing {
            // Nothing but duplicates reached this node.
            return Ok(());
        }

        let capacity = self.current().max_keys();
        let mut node = self.take_for_write();
        let placed = if combined.len() <= capacity {
            self.place_right_aligned(&mut node, &combined, buffer, next_offset)
        } else {
            self.rebalance(&mut node, &combined, buffer, next_offset)
        };
        self.current = Some(node);
        placed
    }

    /// All entries fit: lay them out sorted against the slot tail. Only
    /// childless nodes take this path, so emptying the leading slots cannot
    /// orphan a child.
    fn place_right_aligned(
        &mut self,
        node: &mut Node,
        combined: &BTreeMap<Key, Source>,
        buffer: &WriteBuffer,
        next_offset: &mut u64,
    ) -> Result<()> {
        node.clear();
        let start = node.max_keys() - combined.len();
        for (i, (key, source)) in combined.iter().enumerate() {
            let kv = place(key, source, buffer, next_offset)?;
            node.set_slot(start + i, kv);
        }
        self.insertions = combined.len() as u64 - self.existing;
        Ok(())
    }

    /// Too many entries: keep the one nearest each stride anchor, fill the
    /// rest of the slots with synthetic anchors, and push every loser
    /// toward a child. Losing existing keys are re-staged as evictees;
    /// losing candidates simply stay unprocessed and route down when the
    /// descent recurses.
    fn rebalance(
        &mut self,
        node: &mut Node,
        combined: &BTreeMap<Key, Source>,
        buffer: &WriteBuffer,
        next_offset: &mut u64,
    ) -> Result<()> {
        node.clear();
        let stride = node.stride()?;
        let degree = node.degree();
        let mut best: Vec<Option<(Key, Key)>> = vec![None; node.max_keys()];
        for key in combined.keys() {
            let (index, distance) = nearest_stride(node.first(), &stride, degree, key)?;
            match &best[index] {
                Some((held, _)) if *held <= distance => {}
                _ => best[index] = Some((distance, *key)),
            }
        }

        let mut winners: BTreeSet<Key> = BTreeSet::new();
        for (index, slot) in best.iter().enumerate() {
            let Some((_, key)) = slot else {
                continue;
            };
            let source = combined.get(key).expect("winner drawn from combined");
            let kv = place(key, source, buffer, next_offset)?;
            node.set_slot(index, kv);
            if !matches!(source, Source::Existing(_)) {
                self.insertions += 1;
            }
            winners.insert(*key);
        }
        self.synthetics = node.add_synthetics()? as u64;

        for (key, source) in combined {
            if winners.contains(key) {
                continue;
            }
            if let Source::Existing(kv) = source {
                buffer.add_evictee(*key, kv.offset, kv.length)?;
                self.evictions += 1;
            }
        }
        Ok(())
    }
}

fn place(
    key: &Key,
    source: &Source,
    buffer: &WriteBuffer,
    next_offset: &mut u64,
) -> Result<KeyValue> {
    match source {
        Source::Existing(kv) | Source::Evictee(kv) => Ok(*kv),
        Source::Candidate => {
            let (offset, length) = buffer.set_offset(key, *next_offset)?;
            *next_offset += length as u64;
            Ok(KeyValue {
                key: *key,
                offset,
                length,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::values::record_len;
    use crate::types::EMPTY_CHILD;

    fn empty_node(degree: u32) -> Arc<Node> {
        Arc::new(Node::new(NodeId(0), 0, degree, Key::from_u64(1), Key::MAX).unwrap())
    }

    fn stage(buffer: &WriteBuffer, keys: &[u64]) -> Vec<(Key, u32)> {
        let mut candidates = Vec::new();
        for &k in keys {
            let key = Key::from_u64(k);
            buffer.add(key, b"payload".to_vec());
            candidates.push((key, record_len(7) as u32));
        }
        candidates
    }

    #[test]
    fn clean_when_nothing_new() {
        let buffer = WriteBuffer::new();
        let mut delta = Delta::new(empty_node(8));
        let mut offset = 0;
        delta
            .add_keys(Vec::new(), Vec::new(), &buffer, &mut offset)
            .unwrap();
        assert!(!delta.dirty());
        assert!(delta.into_node().is_none());
    }

    #[test]
    fn small_batch_is_right_aligned() {
        let buffer = WriteBuffer::new();
        let candidates = stage(&buffer, &[500, 100, 900]);
        let mut delta = Delta::new(empty_node(8));
        let mut offset = 0;
        delta
            .add_keys(candidates, Vec::new(), &buffer, &mut offset)
            .unwrap();
        assert!(delta.dirty());
        assert_eq!(delta.insertions(), 3);
        let node = delta.into_node().unwrap();
        assert!(node.check_sane().is_ok());
        // Seven slots, three keys: the tail holds them in sorted order.
        assert!(node.slot(0).is_zero());
        assert!(node.slot(3).is_zero());
        assert_eq!(node.slot(4).key, Key::from_u64(100));
        assert_eq!(node.slot(5).key, Key::from_u64(500));
        assert_eq!(node.slot(6).key, Key::from_u64(900));
        // Offsets were assigned contiguously in key order.
        assert_eq!(node.slot(4).offset, 0);
        assert_eq!(node.slot(5).offset, record_len(7));
        assert_eq!(buffer.ready_for_committing(), 3);
    }

    #[test]
    fn overflow_keeps_nearest_and_evicts_existing_losers() {
        let buffer = WriteBuffer::new();
        let degree = 4;
        // Capacity 3. Seed the node with three existing keys, then push two
        // candidates so the stride competition must reject two entries.
        let mut seeded = (*empty_node(degree)).clone();
        let stride = seeded.stride().unwrap();
        let anchor1 = stride.checked_mul_u64(1).unwrap();
        let anchor2 = stride.checked_mul_u64(2).unwrap();
        let near1 = anchor1.checked_add(&Key::from_u64(5)).unwrap();
        let near2 = anchor2.checked_add(&Key::from_u64(5)).unwrap();
        let far2 = anchor2.checked_add(&Key::from_u64(1_000_000)).unwrap();
        for (i, key) in [near1, near2, far2].iter().enumerate() {
            seeded.set_slot(
                i,
                KeyValue {
                    key: *key,
                    offset: 1000 + i as u64,
                    length: 48,
                },
            );
        }
        assert!(seeded.check_sane().is_ok());

        // One candidate lands exactly on anchor 2 and must win that slot.
        buffer.add(anchor2, b"payload".to_vec());
        let candidates = vec![(anchor2, record_len(7) as u32)];

        let mut delta = Delta::new(Arc::new(seeded));
        let mut offset = 0;
        delta
            .add_keys(candidates, Vec::new(), &buffer, &mut offset)
            .unwrap();
        assert!(delta.dirty());
        let node = delta.into_node().unwrap();
        assert!(node.check_sane().is_ok());
        assert!(node.is_full());
        // anchor2 displaced near2 and far2 from slot 1's competition.
        assert_eq!(node.slot(1).key, anchor2);
        assert_eq!(node.slot(0).key, near1);
        // The displaced existing keys are now evictees carrying offsets.
        let mut evictions = Vec::new();
        let mut leftover = Vec::new();
        buffer.get_candidates(&Key::from_u64(1), &Key::MAX, &mut leftover, &mut evictions);
        let evicted: Vec<Key> = evictions.iter().map(|kv| kv.key).collect();
        assert!(evicted.contains(&near2));
        assert!(evicted.contains(&far2));
        assert_eq!(evictions.iter().find(|kv| kv.key == near2).unwrap().offset, 1001);
    }

    #[test]
    fn losing_candidates_stay_unprocessed() {
        let buffer = WriteBuffer::new();
        let degree = 4;
        let node = empty_node(degree);
        let stride = node.stride().unwrap();
        let anchor1 = stride.checked_mul_u64(1).unwrap();
        let winner = anchor1;
        let loser = anchor1.checked_add(&Key::from_u64(99)).unwrap();
        // Both map to slot 0; more entries than capacity forces a rebalance.
        let far_a = stride.checked_mul_u64(2).unwrap();
        let far_b = stride
            .checked_mul_u64(3)
            .unwrap()
            .checked_sub(&Key::from_u64(77))
            .unwrap();
        let mut candidates = Vec::new();
        for key in [winner, loser, far_a, far_b] {
            buffer.add(key, b"payload".to_vec());
            candidates.push((key, record_len(7) as u32));
        }
        let mut delta = Delta::new(node);
        let mut offset = 0;
        delta
            .add_keys(candidates, Vec::new(), &buffer, &mut offset)
            .unwrap();
        let node = delta.into_node().unwrap();
        assert_eq!(node.slot(0).key, winner);
        // The loser is still an unprocessed candidate for a child pass.
        let mut leftover = Vec::new();
        let mut evictions = Vec::new();
        buffer.get_candidates(&Key::from_u64(1), &Key::MAX, &mut leftover, &mut evictions);
        assert_eq!(leftover.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![loser]);
        assert!(evictions.is_empty());
        assert_eq!(buffer.ready_for_committing(), 3);
    }

    #[test]
    fn evictees_are_placed_with_their_disk_offsets() {
        let buffer = WriteBuffer::new();
        let node = empty_node(8);
        let evictee = KeyValue {
            key: Key::from_u64(4242),
            offset: 8192,
            length: 96,
        };
        buffer
            .add_evictee(evictee.key, evictee.offset, evictee.length)
            .unwrap();
        let mut delta = Delta::new(node);
        let mut offset = 0;
        delta
            .add_keys(Vec::new(), vec![evictee], &buffer, &mut offset)
            .unwrap();
        let node = delta.into_node().unwrap();
        assert_eq!(node.find(&evictee.key), Some((8192, 96)));
        // No new value bytes were scheduled for writing.
        assert_eq!(buffer.ready_for_committing(), 0);
        assert_eq!(offset, 0);
    }

    #[test]
    fn set_child_flips_lazily() {
        let mut delta = Delta::new(empty_node(8));
        assert!(!delta.dirty());
        delta.set_child(0, NodeId(512));
        assert!(delta.dirty());
        assert_eq!(delta.children_updated(), 1);
        assert_eq!(delta.current().child(0), NodeId(512));
        assert_eq!(delta.current().child(1), EMPTY_CHILD);
    }
}
