#![forbid(unsafe_code)]
//! Engine counters. Hot paths bump relaxed atomics; `snapshot` captures a
//! consistent-enough view for logging and the stats surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    buffer_hits: AtomicU64,
    key_misses: AtomicU64,
    value_hits: AtomicU64,
    value_misses: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    keys_flushed: AtomicU64,
}

/// Point-in-time engine telemetry.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Gets answered straight from the write buffer.
    pub buffer_hits: u64,
    /// Gets that missed both the buffer and the tree.
    pub key_misses: u64,
    /// Tree hits whose value read succeeded.
    pub value_hits: u64,
    /// Tree hits whose value read failed.
    pub value_misses: u64,
    /// Completed flush passes.
    pub flushes: u64,
    /// Flush passes that returned an error.
    pub flush_failures: u64,
    /// Net keys inserted across all flushes.
    pub keys_flushed: u64,
}

impl Metrics {
    pub fn record_buffer_hit(&self) {
        self.buffer_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_miss(&self) {
        self.key_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_value_hit(&self) {
        self.value_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_value_miss(&self) {
        self.value_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, keys_flushed: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.keys_flushed.fetch_add(keys_flushed, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            key_misses: self.key_misses.load(Ordering::Relaxed),
            value_hits: self.value_hits.load(Ordering::Relaxed),
            value_misses: self.value_misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            keys_flushed: self.keys_flushed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = Metrics::default();
        metrics.record_buffer_hit();
        metrics.record_buffer_hit();
        metrics.record_key_miss();
        metrics.record_value_hit();
        metrics.record_flush(42);
        metrics.record_flush(8);
        metrics.record_flush_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.buffer_hits, 2);
        assert_eq!(snap.key_misses, 1);
        assert_eq!(snap.value_hits, 1);
        assert_eq!(snap.value_misses, 0);
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.keys_flushed, 50);
        assert_eq!(snap.flush_failures, 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let metrics = Metrics::default();
        metrics.record_value_hit();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"value_hits\":1"));
    }
}
