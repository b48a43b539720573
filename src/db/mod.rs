#![forbid(unsafe_code)]
//! The engine: stores, cache, buffer and tree wired together, plus the
//! background flush worker.
//!
//! `put` only stages into the buffer; durability arrives when a flush pass
//! has committed the key. `get` reads the buffer first, then descends the
//! tree and fetches the value record. One worker thread flushes once per
//! interval and performs a final flush on shutdown.

pub mod config;
pub mod metrics;

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, trace, warn};

use crate::key::{Key, KEY_BYTES};
use crate::storage::buffer::WriteBuffer;
use crate::storage::cache::{CacheStats, NodeCache};
use crate::storage::keys::{FileKeyStore, KeyStore, MemoryKeyStore};
use crate::storage::node::calculate_degree;
use crate::storage::values::{FileValueStore, MemoryValueStore, ValueStore, VALUE_HEADER_LEN};
use crate::tree::journal::Journal;
use crate::tree::Tree;
use crate::types::{EstriaError, Result};

pub use config::Config;
pub use metrics::{Metrics, MetricsSnapshot};

/// Longest accepted value: the record length must fit the 32-bit length
/// field of a node slot, header included.
pub const MAX_VALUE_LEN: usize = u32::MAX as usize - VALUE_HEADER_LEN;

enum WorkerMessage {
    Shutdown,
}

struct FlushWorker {
    sender: Sender<WorkerMessage>,
    handle: thread::JoinHandle<()>,
}

struct DbInner {
    config: Config,
    keys: Arc<dyn KeyStore>,
    values: Arc<dyn ValueStore>,
    cache: Arc<NodeCache>,
    buffer: WriteBuffer,
    tree: Tree,
    metrics: Metrics,
    // Serializes flush passes between the worker and explicit callers.
    flush_lock: Mutex<()>,
}

pub struct Db {
    inner: Arc<DbInner>,
    worker: Mutex<Option<FlushWorker>>,
}

/// Everything the stats surface exposes, JSON-serializable.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct DbStats {
    pub metrics: MetricsSnapshot,
    pub cache: CacheStats,
    pub buffer_size: usize,
    pub key_store_size: u64,
    pub value_store_size: u64,
}

impl Db {
    /// Opens (creating if needed) a store over the given key and value
    /// files. Not thread-safe; a single engine instance per file pair is
    /// required.
    pub fn open(key_path: impl AsRef<Path>, value_path: impl AsRef<Path>) -> Result<Db> {
        Self::open_with_config(key_path, value_path, Config::default())
    }

    pub fn open_with_config(
        key_path: impl AsRef<Path>,
        value_path: impl AsRef<Path>,
        config: Config,
    ) -> Result<Db> {
        let keys: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(key_path, config.block_size)?);
        let values: Arc<dyn ValueStore> = Arc::new(FileValueStore::open(value_path)?);
        Self::assemble(keys, values, config)
    }

    /// An ephemeral in-memory store with the same semantics, for tests and
    /// tooling.
    pub fn open_memory(config: Config) -> Result<Db> {
        let degree = calculate_degree(config.block_size)?;
        let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new(degree));
        let values: Arc<dyn ValueStore> = Arc::new(MemoryValueStore::new());
        Self::assemble(keys, values, config)
    }

    fn assemble(
        keys: Arc<dyn KeyStore>,
        values: Arc<dyn ValueStore>,
        config: Config,
    ) -> Result<Db> {
        let cache = Arc::new(NodeCache::new(config.cache_size));
        let tree = Tree::new(Arc::clone(&keys), Arc::clone(&cache));
        tree.init(true)?;
        info!(
            degree = keys.degree(),
            block_size = config.block_size,
            cache_size = config.cache_size,
            "db.open"
        );
        let inner = Arc::new(DbInner {
            config,
            keys,
            values,
            cache,
            buffer: WriteBuffer::new(),
            tree,
            metrics: Metrics::default(),
            flush_lock: Mutex::new(()),
        });
        let worker = Self::spawn_worker(Arc::clone(&inner));
        Ok(Db {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn spawn_worker(inner: Arc<DbInner>) -> FlushWorker {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || Self::worker_loop(inner, receiver));
        FlushWorker { sender, handle }
    }

    fn worker_loop(inner: Arc<DbInner>, receiver: Receiver<WorkerMessage>) {
        loop {
            match receiver.recv_timeout(inner.config.flush_interval) {
                Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    if let Err(error) = Self::run_flush(&inner) {
                        inner.metrics.record_flush_failure();
                        error!(%error, "db.flush.final");
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(error) = Self::run_flush(&inner) {
                        inner.metrics.record_flush_failure();
                        match error {
                            // Invariant violations are unrecoverable; stop
                            // flushing and leave reads serviceable.
                            EstriaError::Corruption(_)
                            | EstriaError::BadCommit(_)
                            | EstriaError::Invalid(_) => {
                                error!(%error, "db.flush.abort");
                                break;
                            }
                            // IO errors heal by retrying next tick.
                            _ => warn!(%error, "db.flush.retry"),
                        }
                    }
                }
            }
        }
    }

    fn run_flush(inner: &DbInner) -> Result<()> {
        let _guard = inner.flush_lock.lock();
        let mut journal = Journal::new(&inner.buffer, inner.values.as_ref());
        journal.process(&inner.tree)?;
        if journal.size() > 0 {
            let counts = inner.buffer.status_counts();
            info!(
                ready = counts.needs_committing,
                evicted = counts.evicted,
                staged = inner.buffer.size(),
                nodes = journal.size(),
                metrics = ?inner.metrics.snapshot(),
                cache = %inner.cache.stats(),
                "db.flush"
            );
        } else {
            trace!("db.flush.clean");
        }
        let inserted = journal.total_insertions();
        journal.commit(&inner.tree, inner.config.commit_batch)?;
        inner.metrics.record_flush(inserted);
        Ok(())
    }

    /// Stages a write. The first put wins while a key is buffer-resident;
    /// a put whose key already sits in the tree is dropped at flush time.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() != KEY_BYTES {
            return Err(EstriaError::KeyWrongLength);
        }
        if value.is_empty() {
            return Err(EstriaError::ZeroLengthValue);
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(EstriaError::ValueTooLong);
        }
        let key = Key::from_bytes(key)?;
        if key.is_zero() {
            return Err(EstriaError::Invalid("the zero key is reserved"));
        }
        self.inner.buffer.add(key, value.to_vec());
        Ok(())
    }

    /// Reads a value: buffer first, then tree descent plus a value-record
    /// read.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.len() != KEY_BYTES {
            return Err(EstriaError::KeyWrongLength);
        }
        let key = Key::from_bytes(key)?;
        if let Some(value) = self.inner.buffer.get(&key) {
            self.inner.metrics.record_buffer_hit();
            return Ok(value);
        }
        let (offset, length) = self.inner.tree.get(&key).map_err(|error| {
            if matches!(error, EstriaError::KeyNotFound) {
                self.inner.metrics.record_key_miss();
            }
            error
        })?;
        match self.inner.values.get(offset, length) {
            Ok(value) => {
                self.inner.metrics.record_value_hit();
                Ok(value)
            }
            Err(error) => {
                self.inner.metrics.record_value_miss();
                Err(error)
            }
        }
    }

    /// Streams every committed `(key, value)` pair in value-log insertion
    /// order. Buffered, not-yet-flushed writes are not included.
    pub fn each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        self.inner.values.each(&mut f)
    }

    /// Runs one full flush pass synchronously.
    pub fn flush(&self) -> Result<()> {
        Self::run_flush(&self.inner)
    }

    /// Drops all data and reinitializes the root. Not thread-safe; callers
    /// must ensure no concurrent puts, gets or flushes.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.inner.flush_lock.lock();
        self.inner.buffer.clear();
        self.inner.cache.reset();
        self.inner.keys.clear()?;
        self.inner.values.clear()?;
        self.inner.tree.init(true)
    }

    /// Stops the flush worker (running one final flush), then syncs both
    /// stores. Idempotent.
    pub fn close(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.sender.send(WorkerMessage::Shutdown);
            if worker.handle.join().is_err() {
                error!("db.close.worker_panicked");
            }
        }
        self.inner.values.sync()?;
        self.inner.keys.sync()?;
        info!(metrics = ?self.inner.metrics.snapshot(), "db.close");
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            metrics: self.inner.metrics.snapshot(),
            cache: self.inner.cache.stats(),
            buffer_size: self.inner.buffer.size(),
            key_store_size: self.inner.keys.size(),
            value_store_size: self.inner.values.size(),
        }
    }

    /// Diagnostic: verifies every reachable node's invariants.
    pub fn check_sane(&self) -> Result<()> {
        self.inner.tree.check_sane()
    }

    /// Diagnostic: number of real keys indexed by the tree.
    pub fn indexed_keys(&self) -> Result<u64> {
        self.inner.tree.non_synthetic_key_count()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            error!(%error, "db.drop.close");
        }
    }
}
