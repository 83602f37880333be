#![forbid(unsafe_code)]

use std::{path::PathBuf, time::Duration};

use reelcache_platform::ThreadPool;

/// One week.
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Configuration for a [`VideoCache`](crate::VideoCache).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Directory holding every data and index file.
    pub root_dir: PathBuf,
    /// Entries not modified for longer than this are removed by
    /// [`delete_old_files`](crate::VideoCache::delete_old_files).
    pub max_cache_age: Duration,
    /// Soft cap on total bytes. `None` disables the size pass.
    pub max_cache_size: Option<u64>,
    /// Pool for deferred index writes and directory scans.
    pub pool: ThreadPool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("reelcache"))
    }
}

impl CacheConfig {
    pub fn new<P: Into<PathBuf>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            max_cache_size: None,
            pool: ThreadPool::global(),
        }
    }

    #[must_use]
    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    #[must_use]
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: ThreadPool) -> Self {
        self.pool = pool;
        self
    }
}
