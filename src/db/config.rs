use std::time::Duration;

/// Engine tuning. Paths are passed to `Db::open` separately.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of one key-file block; fixes the node degree at open time.
    pub block_size: u32,
    /// Maximum nodes held by the cache. Zero disables caching.
    pub cache_size: usize,
    /// Sleep between background flush passes.
    pub flush_interval: Duration,
    /// Buffer entries committed per lock acquisition during a flush.
    pub commit_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_size: 10_000,
            flush_interval: Duration::from_secs(1),
            commit_batch: 1024,
        }
    }
}

impl Config {
    /// Tuned for sustained bulk insertion: bigger commit batches and a
    /// larger cache, flushing more eagerly.
    pub fn bulk_load() -> Self {
        Self {
            block_size: 4096,
            cache_size: 50_000,
            flush_interval: Duration::from_millis(250),
            commit_batch: 8192,
        }
    }
}
