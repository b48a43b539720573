#![forbid(unsafe_code)]
//! The stride-partitioned search tree.
//!
//! The tree itself carries no mutable state; it composes the key store and
//! the node cache. The root always occupies block 0 and covers `(1, max)`.
//! Descent picks the child whose subrange strictly contains the key, so
//! slot keys act as exclusive fences. A flush builds a journal of
//! copy-on-write deltas against the live buffer and never mutates a node
//! snapshot that a reader might hold.

pub mod delta;
pub mod journal;

use std::sync::Arc;

use crate::key::Key;
use crate::storage::buffer::WriteBuffer;
use crate::storage::cache::NodeCache;
use crate::storage::keys::KeyStore;
use crate::storage::node::Node;
use crate::tree::delta::Delta;
use crate::tree::journal::Journal;
use crate::types::{EstriaError, NodeId, Result, EMPTY_CHILD};

/// The root's block offset.
pub const ROOT_ID: NodeId = NodeId(0);

pub struct Tree {
    keys: Arc<dyn KeyStore>,
    cache: Arc<NodeCache>,
}

impl Tree {
    pub fn new(keys: Arc<dyn KeyStore>, cache: Arc<NodeCache>) -> Self {
        Self { keys, cache }
    }

    /// Creates the root if the store does not have one yet. The root covers
    /// every storable key; zero stays reserved as the empty sentinel.
    pub fn init(&self, add_synthetics: bool) -> Result<()> {
        if self.keys.has(ROOT_ID) {
            return Ok(());
        }
        let mut root = self
            .keys
            .new_node(0, Key::from_u64(1), Key::MAX)?;
        if root.id() != ROOT_ID {
            return Err(EstriaError::Corruption("root must be the first allocation"));
        }
        if add_synthetics {
            root.add_synthetics()?;
        }
        self.keys.set(&root)?;
        self.cache.add(Arc::new(root));
        Ok(())
    }

    /// Looks a key up, returning the offset and total length of its value
    /// record. Descent starts at the deepest cached node covering the key.
    pub fn get(&self, key: &Key) -> Result<(u64, u32)> {
        if key.is_zero() {
            return Err(EstriaError::KeyNotFound);
        }
        let start = match self.cache.get(key) {
            Some(node) => node,
            None => self.load(ROOT_ID, 0)?,
        };
        self.descend(&start, key)
    }

    fn descend(&self, node: &Arc<Node>, key: &Key) -> Result<(u64, u32)> {
        if let Some(found) = node.find(key) {
            return Ok(found);
        }
        let mut next = EMPTY_CHILD;
        node.each_child(|_, lo, hi, child| {
            if lo < key && key < hi {
                next = child;
            }
            Ok(())
        })?;
        if next == EMPTY_CHILD {
            return Err(EstriaError::KeyNotFound);
        }
        let child = self.load(next, node.level() + 1)?;
        self.descend(&child, key)
    }

    /// Fetches a node through the cache, stamping its level on a store
    /// miss (levels are not part of the block layout).
    pub(crate) fn load(&self, id: NodeId, level: u32) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get_by_id(id) {
            return Ok(node);
        }
        let mut node = self.keys.get(id)?;
        node.set_level(level);
        let node = Arc::new(node);
        self.cache.add(Arc::clone(&node));
        Ok(node)
    }

    /// Writes a flushed successor node and refreshes the cache so readers
    /// switch to it atomically.
    pub(crate) fn persist(&self, node: Node) -> Result<()> {
        self.keys.set(&node)?;
        self.cache.add(Arc::new(node));
        Ok(())
    }

    /// The add pass: walk the tree against the buffer, producing a delta
    /// for every node this flush will rewrite.
    pub(crate) fn add(&self, buffer: &WriteBuffer, journal: &mut Journal<'_>) -> Result<()> {
        let root = self.load(ROOT_ID, 0)?;
        self.add_node(root, 0, buffer, journal)
    }

    fn add_node(
        &self,
        node: Arc<Node>,
        level: u32,
        buffer: &WriteBuffer,
        journal: &mut Journal<'_>,
    ) -> Result<()> {
        let mut delta = Delta::new(Arc::clone(&node));

        let mut candidates = Vec::new();
        let mut evictions = Vec::new();
        buffer.get_candidates(node.first(), node.last(), &mut candidates, &mut evictions);
        // A put whose key already lives here is dropped: the on-disk value
        // wins and the stale buffer entry must not route into a child.
        let mut fresh = Vec::with_capacity(candidates.len());
        for (key, length) in candidates {
            if node.find(&key).is_some() {
                buffer.remove_duplicate(&key)?;
            } else {
                fresh.push((key, length));
            }
        }

        // Nodes with children are full and keep their keys; everything
        // pending descends. Childless nodes absorb or rebalance.
        if !node.has_children() && (!fresh.is_empty() || !evictions.is_empty()) {
            delta.add_keys(fresh, evictions, buffer, &mut journal.next_offset)?;
            delta.check_sanity()?;
        }

        if delta.current().is_full() {
            let mut targets = Vec::new();
            delta.current().each_child(|i, lo, hi, child| {
                targets.push((i, *lo, *hi, child));
                Ok(())
            })?;
            for (i, lo, hi, child) in targets {
                if !buffer.contains_range(&lo, &hi)? {
                    continue;
                }
                let child = if child == EMPTY_CHILD {
                    let allocated = self.keys.new_node(level + 1, lo, hi)?;
                    delta.set_child(i, allocated.id());
                    Arc::new(allocated)
                } else {
                    self.load(child, level + 1)?
                };
                self.add_node(child, level + 1, buffer, journal)?;
            }
        }

        delta.check_sanity()?;
        if delta.dirty() {
            journal.push(level, delta);
        }
        Ok(())
    }

    /// Visits every node reachable from the root, shallowest first.
    pub fn walk<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&Node, u32) -> Result<()>,
    {
        self.walk_node(ROOT_ID, 0, f)
    }

    fn walk_node<F>(&self, id: NodeId, level: u32, f: &mut F) -> Result<()>
    where
        F: FnMut(&Node, u32) -> Result<()>,
    {
        let node = self.load(id, level)?;
        f(&node, level)?;
        let mut children = Vec::new();
        node.each_child(|_, _, _, child| {
            if child != EMPTY_CHILD {
                children.push(child);
            }
            Ok(())
        })?;
        for child in children {
            self.walk_node(child, level + 1, f)?;
        }
        Ok(())
    }

    /// Verifies every reachable node, returning the first violation.
    pub fn check_sane(&self) -> Result<()> {
        self.walk(&mut |node, _| node.check_sane())
    }

    pub fn is_sane(&self) -> bool {
        self.check_sane().is_ok()
    }

    /// Counts the real keys stored in the tree, ignoring synthetic anchors.
    pub fn non_synthetic_key_count(&self) -> Result<u64> {
        let mut count = 0u64;
        self.walk(&mut |node, _| {
            count += node.non_synthetic_key_count() as u64;
            Ok(())
        })?;
        Ok(count)
    }
}
