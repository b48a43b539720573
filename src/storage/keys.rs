#![forbid(unsafe_code)]
//! The key file: fixed-size blocks addressed by offset, one node per block.
//!
//! Block offsets double as node ids. Allocation only bumps the size counter;
//! a fresh node reaches disk when a journal commit writes it, so a failed
//! flush leaves nothing but an unreferenced hole.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::key::Key;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::node::{calculate_degree, Node};
use crate::types::{EstriaError, NodeId, Result};

pub trait KeyStore: Send + Sync {
    /// Allocates the next block and returns a fresh node bound to it. The
    /// node is not persisted until `set` is called.
    fn new_node(&self, level: u32, first: Key, last: Key) -> Result<Node>;
    /// Reads and parses the node stored at `id`. The caller stamps the
    /// level, which is not part of the block layout.
    fn get(&self, id: NodeId) -> Result<Node>;
    /// Serializes `node` into its block.
    fn set(&self, node: &Node) -> Result<()>;
    /// Whether a block has been allocated for `id`.
    fn has(&self, id: NodeId) -> bool;
    fn degree(&self) -> u32;
    /// Bytes allocated (file backend) or nodes allocated (memory backend).
    fn size(&self) -> u64;
    fn sync(&self) -> Result<()>;
    /// Drops every node. Not thread-safe.
    fn clear(&self) -> Result<()>;
}

pub struct FileKeyStore {
    io: StdFileIo,
    block_size: u32,
    degree: u32,
    size: AtomicU64,
}

impl FileKeyStore {
    pub fn open(path: impl AsRef<std::path::Path>, block_size: u32) -> Result<Self> {
        let degree = calculate_degree(block_size)?;
        let io = StdFileIo::open(path)?;
        let size = io.len()?;
        if size % block_size as u64 != 0 {
            return Err(EstriaError::Corruption("key file is not block aligned"));
        }
        Ok(Self {
            io,
            block_size,
            degree,
            size: AtomicU64::new(size),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

impl KeyStore for FileKeyStore {
    fn new_node(&self, level: u32, first: Key, last: Key) -> Result<Node> {
        let id = self.size.fetch_add(self.block_size as u64, Ordering::SeqCst);
        Node::new(NodeId(id), level, self.degree, first, last)
    }

    fn get(&self, id: NodeId) -> Result<Node> {
        let mut block = vec![0u8; self.block_size as usize];
        let read = self.io.read_at(id.0, &mut block)?;
        if read == 0 {
            return Err(EstriaError::KeyNotFound);
        }
        if read < block.len() {
            return Err(EstriaError::ShortRead);
        }
        Node::deserialize(id, self.degree, &block)
    }

    fn set(&self, node: &Node) -> Result<()> {
        let mut block = vec![0u8; self.block_size as usize];
        node.serialize(&mut block)?;
        self.io.write_all_at(node.id().0, &block)
    }

    fn has(&self, id: NodeId) -> bool {
        id.0 + self.block_size as u64 <= self.size()
    }

    fn degree(&self) -> u32 {
        self.degree
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

/// In-memory backend for tests. Ids count up by one instead of by block.
pub struct MemoryKeyStore {
    degree: u32,
    nodes: Mutex<HashMap<u64, Node>>,
    next: AtomicU64,
}

impl MemoryKeyStore {
    pub fn new(degree: u32) -> Self {
        Self {
            degree,
            nodes: Mutex::new(HashMap::new()),
            next: AtomicU64::new(0),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn new_node(&self, level: u32, first: Key, last: Key) -> Result<Node> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        Node::new(NodeId(id), level, self.degree, first, last)
    }

    fn get(&self, id: NodeId) -> Result<Node> {
        self.nodes
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or(EstriaError::KeyNotFound)
    }

    fn set(&self, node: &Node) -> Result<()> {
        self.nodes.lock().insert(node.id().0, node.clone());
        Ok(())
    }

    fn has(&self, id: NodeId) -> bool {
        self.nodes.lock().contains_key(&id.0)
    }

    fn degree(&self) -> u32 {
        self.degree
    }

    fn size(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.nodes.lock().clear();
        self.next.store(0, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::KeyValue;
    use tempfile::tempdir;

    #[test]
    fn allocation_strides_by_block() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys.db"), 512).unwrap();
        let a = store.new_node(0, Key::from_u64(1), Key::MAX).unwrap();
        let b = store.new_node(1, Key::from_u64(1), Key::MAX).unwrap();
        assert_eq!(a.id(), NodeId(0));
        assert_eq!(b.id(), NodeId(512));
        assert_eq!(store.size(), 1024);
        assert!(store.has(NodeId(0)));
        assert!(store.has(NodeId(512)));
        assert!(!store.has(NodeId(1024)));
    }

    #[test]
    fn set_get_roundtrip_with_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let id = {
            let store = FileKeyStore::open(&path, 512).unwrap();
            let mut node = store.new_node(0, Key::from_u64(1), Key::MAX).unwrap();
            node.add_synthetics().unwrap();
            node.set_slot(
                0,
                KeyValue {
                    key: node.slot(0).key,
                    offset: 64,
                    length: 96,
                },
            );
            store.set(&node).unwrap();
            store.sync().unwrap();
            node.id()
        };
        let store = FileKeyStore::open(&path, 512).unwrap();
        let node = store.get(id).unwrap();
        assert_eq!(node.id(), id);
        assert_eq!(node.slot(0).offset, 64);
        assert!(node.is_full());
    }

    #[test]
    fn get_distinguishes_missing_from_allocated() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys.db"), 512).unwrap();
        // Allocated but never written: nothing on disk yet.
        let node = store.new_node(0, Key::from_u64(1), Key::MAX).unwrap();
        assert!(matches!(store.get(node.id()), Err(EstriaError::KeyNotFound)));
    }

    #[test]
    fn open_rejects_misaligned_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.db");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(
            FileKeyStore::open(&path, 512),
            Err(EstriaError::Corruption(_))
        ));
    }

    #[test]
    fn clear_resets_allocation() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys.db"), 512).unwrap();
        let node = store.new_node(0, Key::from_u64(1), Key::MAX).unwrap();
        store.set(&node).unwrap();
        store.clear().unwrap();
        assert_eq!(store.size(), 0);
        assert!(!store.has(NodeId(0)));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryKeyStore::new(16);
        let node = store.new_node(0, Key::from_u64(1), Key::MAX).unwrap();
        assert!(!store.has(node.id()));
        store.set(&node).unwrap();
        assert!(store.has(node.id()));
        assert_eq!(store.get(node.id()).unwrap().id(), node.id());
        assert!(matches!(
            store.get(NodeId(99)),
            Err(EstriaError::KeyNotFound)
        ));
    }
}
