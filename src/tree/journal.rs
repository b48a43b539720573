#![forbid(unsafe_code)]
//! One flush pass worth of dirty nodes.
//!
//! `process` walks the tree against the live buffer, collecting a delta per
//! dirty node and handing out value-file offsets as candidates are placed.
//! `commit` persists values first, then nodes from the deepest level up, so
//! no parent on disk can ever point at an unwritten child. The buffer is
//! purged of evicted and committed residue once everything is down.

use std::collections::BTreeMap;

use tracing::debug;

use crate::storage::buffer::WriteBuffer;
use crate::storage::values::ValueStore;
use crate::tree::delta::Delta;
use crate::tree::Tree;
use crate::types::Result;

pub struct Journal<'a> {
    buffer: &'a WriteBuffer,
    values: &'a dyn ValueStore,
    deltas: BTreeMap<u32, Vec<Delta>>,
    count: usize,
    pub(crate) next_offset: u64,
}

impl<'a> Journal<'a> {
    pub fn new(buffer: &'a WriteBuffer, values: &'a dyn ValueStore) -> Self {
        // Offsets from a failed pass may still sit in the buffer above the
        // store's size; never hand them out twice.
        let next_offset = values.size().max(buffer.assigned_end());
        Self {
            buffer,
            values,
            deltas: BTreeMap::new(),
            count: 0,
            next_offset,
        }
    }

    /// Runs the add pass, filling this journal with copy-on-write deltas.
    pub fn process(&mut self, tree: &Tree) -> Result<()> {
        let buffer = self.buffer;
        tree.add(buffer, self)
    }

    /// Persists the pass: values in batches, then dirty nodes deepest
    /// first, then drops the buffer residue.
    pub fn commit(&mut self, tree: &Tree, batch_size: usize) -> Result<()> {
        self.buffer.commit(self.values, batch_size)?;
        let deltas = std::mem::take(&mut self.deltas);
        for (level, group) in deltas.into_iter().rev() {
            for delta in group {
                let insertions = delta.insertions();
                let evictions = delta.evictions();
                if let Some(node) = delta.into_node() {
                    debug!(
                        level,
                        node = node.id().0,
                        insertions,
                        evictions,
                        "journal.commit.node"
                    );
                    tree.persist(node)?;
                }
            }
        }
        self.buffer.purge()
    }

    pub(crate) fn push(&mut self, level: u32, delta: Delta) {
        self.deltas.entry(level).or_default().push(delta);
        self.count += 1;
    }

    /// Number of dirty nodes collected.
    pub fn size(&self) -> usize {
        self.count
    }

    /// Net keys added across all deltas: insertions minus evictions.
    pub fn total_insertions(&self) -> u64 {
        let inserted: u64 = self.each_delta().map(Delta::insertions).sum();
        let evicted: u64 = self.each_delta().map(Delta::evictions).sum();
        inserted.saturating_sub(evicted)
    }

    fn each_delta(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values().flatten()
    }
}
