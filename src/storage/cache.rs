#![forbid(unsafe_code)]
//! Bounded cache of node snapshots.
//!
//! Nodes are indexed by `(level, first)` ordered deepest level first, with a
//! side index by node id. Lookup by key returns the deepest cached node
//! strictly containing the key, so descent can start as far down the tree
//! as the cache allows.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::key::Key;
use crate::storage::node::Node;
use crate::types::NodeId;

/// Primary index position: deeper levels sort first, then first-key
/// ascending within a level.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct CachePos {
    level: u32,
    first: Key,
}

impl Ord for CachePos {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then_with(|| self.first.cmp(&other.first))
    }
}

impl PartialOrd for CachePos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    inserts: u64,
    updates: u64,
}

struct CacheInner {
    nodes: Option<LruCache<u64, Arc<Node>>>,
    index: BTreeMap<CachePos, u64>,
    counters: CacheCounters,
}

pub struct NodeCache {
    inner: Mutex<CacheInner>,
}

/// Point-in-time cache telemetry.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub updates: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} hits: {} misses: {} inserts: {} updates: {}",
            self.size, self.capacity, self.hits, self.misses, self.inserts, self.updates
        )
    }
}

impl NodeCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                nodes: NonZeroUsize::new(max_size).map(LruCache::new),
                index: BTreeMap::new(),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Resizes the cache. Intended for use before first traffic; shrinking a
    /// warm cache evicts from the cold end.
    pub fn set_max_size(&self, max_size: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match NonZeroUsize::new(max_size) {
            None => {
                inner.nodes = None;
                inner.index.clear();
            }
            Some(cap) => match inner.nodes.as_mut() {
                Some(nodes) => {
                    while nodes.len() > cap.get() {
                        if let Some((_, stale)) = nodes.pop_lru() {
                            inner.index.remove(&pos_of(&stale));
                        }
                    }
                    nodes.resize(cap);
                }
                None => inner.nodes = Some(LruCache::new(cap)),
            },
        }
    }

    /// Inserts or refreshes a node snapshot, evicting the least recently
    /// used entry at capacity.
    pub fn add(&self, node: Arc<Node>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(nodes) = inner.nodes.as_mut() else {
            return;
        };
        let pos = pos_of(&node);
        let id = node.id().0;
        if let Some(&existing) = inner.index.get(&pos) {
            debug_assert_eq!(existing, id, "cache position bound to another node");
            nodes.push(id, node);
            inner.counters.updates += 1;
            return;
        }
        if let Some((evicted_id, evicted)) = nodes.push(id, node) {
            if evicted_id != id {
                inner.index.remove(&pos_of(&evicted));
            }
        }
        inner.index.insert(pos, id);
        inner.counters.inserts += 1;
    }

    /// Direct lookup by node id.
    pub fn get_by_id(&self, id: NodeId) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        inner.nodes.as_mut()?.get(&id.0).cloned()
    }

    /// Returns the deepest cached node whose range strictly contains `key`.
    /// The zero key never matches: no node's `first` lies below it.
    pub fn get(&self, key: &Key) -> Option<Arc<Node>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(nodes) = inner.nodes.as_mut() else {
            return None;
        };
        if inner.index.is_empty() {
            return None;
        }
        let deepest = inner.index.keys().next().expect("non-empty index").level;
        for level in (1..=deepest + 1).rev() {
            let bound = CachePos { level, first: *key };
            let probe = inner
                .index
                .range(..=bound)
                .next_back()
                .or_else(|| inner.index.iter().next())
                .map(|(pos, &id)| (*pos, id));
            let Some((pos, id)) = probe else {
                break;
            };
            if pos.level > level {
                break;
            }
            let node = nodes.peek(&id).expect("index entry has a node");
            if *node.first() < *key && *node.last() > *key {
                let node = nodes.get(&id).expect("index entry has a node").clone();
                inner.counters.hits += 1;
                return Some(node);
            }
        }
        inner.counters.misses += 1;
        None
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.nodes.as_ref().map_or(0, LruCache::len),
            capacity: inner.nodes.as_ref().map_or(0, |n| n.cap().get()),
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            inserts: inner.counters.inserts,
            updates: inner.counters.updates,
        }
    }

    /// Drops every entry and zeroes the counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(nodes) = inner.nodes.as_mut() {
            nodes.clear();
        }
        inner.index.clear();
        inner.counters = CacheCounters::default();
    }
}

fn pos_of(node: &Node) -> CachePos {
    CachePos {
        level: node.level(),
        first: *node.first(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Result;

    fn node(id: u64, level: u32, first: u64, last: u64) -> Arc<Node> {
        Arc::new(
            Node::new(
                NodeId(id),
                level,
                4,
                Key::from_u64(first),
                Key::from_u64(last),
            )
            .unwrap(),
        )
    }

    #[test]
    fn add_and_get_by_id() {
        let cache = NodeCache::new(4);
        let n = node(0, 0, 1, 1000);
        cache.add(n.clone());
        assert_eq!(cache.get_by_id(NodeId(0)).unwrap().id(), NodeId(0));
        assert!(cache.get_by_id(NodeId(7)).is_none());
        assert_eq!(cache.stats().inserts, 1);
    }

    #[test]
    fn refresh_replaces_snapshot_in_place() {
        let cache = NodeCache::new(4);
        cache.add(node(0, 0, 1, 1000));
        let mut replacement = Node::new(NodeId(0), 0, 4, Key::from_u64(1), Key::from_u64(1000))
            .unwrap();
        replacement.add_synthetics().unwrap();
        cache.add(Arc::new(replacement));
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.updates, 1);
        assert!(cache.get_by_id(NodeId(0)).unwrap().is_full());
    }

    #[test]
    fn capacity_eviction_drops_index_entry() {
        let cache = NodeCache::new(2);
        cache.add(node(0, 0, 1, 1000));
        cache.add(node(1, 1, 1, 500));
        // Touch node 1 so node 0 is the LRU victim.
        cache.get_by_id(NodeId(1));
        cache.add(node(2, 1, 500, 1000));
        assert!(cache.get_by_id(NodeId(0)).is_none());
        assert!(cache.get_by_id(NodeId(1)).is_some());
        assert!(cache.get_by_id(NodeId(2)).is_some());
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn lookup_prefers_deepest_covering_node() {
        let cache = NodeCache::new(8);
        cache.add(node(0, 0, 1, 100_000));
        cache.add(node(1, 1, 1, 50_000));
        cache.add(node(2, 2, 1, 10_000));
        let hit = cache.get(&Key::from_u64(5_000)).unwrap();
        assert_eq!(hit.level(), 2);
        let hit = cache.get(&Key::from_u64(20_000)).unwrap();
        assert_eq!(hit.level(), 1);
        // The probe walks levels deepest-first and never reaches the root
        // while deeper entries exist; descent restarts at the root anyway.
        assert!(cache.get(&Key::from_u64(60_000)).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn lone_root_is_reachable() {
        let cache = NodeCache::new(8);
        cache.add(node(0, 0, 1, 100_000));
        let hit = cache.get(&Key::from_u64(60_000)).unwrap();
        assert_eq!(hit.level(), 0);
    }

    #[test]
    fn lookup_requires_strict_containment() {
        let cache = NodeCache::new(8);
        cache.add(node(1, 1, 100, 200));
        assert!(cache.get(&Key::from_u64(100)).is_none());
        assert!(cache.get(&Key::from_u64(200)).is_none());
        assert!(cache.get(&Key::from_u64(150)).is_some());
    }

    #[test]
    fn zero_key_never_matches() {
        let cache = NodeCache::new(8);
        cache.add(node(0, 0, 1, 1000));
        assert!(cache.get(&Key::ZERO).is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = NodeCache::new(0);
        cache.add(node(0, 0, 1, 1000));
        assert!(cache.get_by_id(NodeId(0)).is_none());
        assert!(cache.get(&Key::from_u64(50)).is_none());
        assert_eq!(cache.stats().size, 0);
        // Sizing it up before traffic turns it on.
        cache.set_max_size(4);
        cache.add(node(0, 0, 1, 1000));
        assert!(cache.get_by_id(NodeId(0)).is_some());
    }

    #[test]
    fn concurrent_readers_and_writers() -> Result<()> {
        let cache = Arc::new(NodeCache::new(64));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let id = t * 1000 + i;
                    cache.add(node(id, 1, id * 10 + 1, id * 10 + 100));
                    cache.get(&Key::from_u64(id * 10 + 50));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("cache worker");
        }
        assert_eq!(cache.stats().size, 64);
        Ok(())
    }
}
