//! estria: an embedded key-value store for fixed-width binary keys.
//!
//! Values live in an append-only log; keys are indexed by an on-disk tree
//! whose nodes partition their range with evenly spaced stride anchors.
//! Writes stage in a concurrent buffer and a background worker flushes
//! them through a copy-on-write journal, writing each dirty node at most
//! once per pass.

pub mod db;
pub mod key;
pub mod primitives;
pub mod storage;
pub mod tree;
pub mod types;

pub use crate::db::{Config, Db, DbStats, MetricsSnapshot};
pub use crate::key::{Key, KEY_BITS, KEY_BYTES};
pub use crate::types::{EstriaError, NodeId, Result};
