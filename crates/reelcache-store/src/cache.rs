#![forbid(unsafe_code)]

use std::{
    fmt, fs, io,
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use dashmap::{DashMap, mapref::entry::Entry};
use reelcache_storage::{CacheFileOptions, IndexStore, RangeCacheFile, WeakRangeCacheFile};

use crate::{
    config::CacheConfig,
    error::StoreResult,
    evict::{CacheEntry, EvictionReport, scan, select_victims},
    key::CachePaths,
};

struct Inner {
    config: CacheConfig,
    /// Open cache files by stem. Entries die with their last handle.
    open: DashMap<String, WeakRangeCacheFile>,
}

/// Directory of range cache files addressed by key.
///
/// ## Normative
/// - One key maps to one data file and one index file under `root_dir`.
/// - Within a process, every [`open_file`](Self::open_file) for a key that is
///   still open returns a handle onto the same shared state.
/// - Removal and eviction never touch a key that is currently open, except
///   [`remove`](Self::remove), which invalidates open handles.
/// - The directory is the source of truth; sizes and counts come from a scan.
#[derive(Clone)]
pub struct VideoCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for VideoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoCache")
            .field("root_dir", &self.inner.config.root_dir)
            .field("open", &self.inner.open.len())
            .finish_non_exhaustive()
    }
}

impl VideoCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                open: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.inner.config.root_dir
    }

    #[must_use]
    pub fn paths_for(&self, key: &str) -> CachePaths {
        CachePaths::for_key(self.root_dir(), key)
    }

    /// Open the cache file for `key`, sharing the live one if it is open.
    ///
    /// Refreshes the data file's modification time so recently used
    /// entries survive age eviction.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened or created.
    pub fn open_file(&self, key: &str) -> StoreResult<RangeCacheFile> {
        let paths = self.paths_for(key);

        let file = match self.inner.open.entry(paths.stem.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(file) => file,
                None => {
                    let file = self.open_from_disk(&paths)?;
                    occupied.insert(file.downgrade());
                    file
                }
            },
            Entry::Vacant(vacant) => {
                let file = self.open_from_disk(&paths)?;
                vacant.insert(file.downgrade());
                file
            }
        };

        touch(&paths.data);
        Ok(file)
    }

    fn open_from_disk(&self, paths: &CachePaths) -> StoreResult<RangeCacheFile> {
        let options = CacheFileOptions::new(&paths.data, &paths.index)
            .with_pool(self.inner.config.pool.clone());
        Ok(RangeCacheFile::open(options)?)
    }

    fn is_open(&self, stem: &str) -> bool {
        self.inner.open.get(stem).is_some_and(|w| w.is_alive())
    }

    /// Whether every byte of `key`'s resource has been cached.
    ///
    /// Stays true after a later response reports a different length, the
    /// same way [`RangeCacheFile::is_complete`] does.
    ///
    /// Reads the index without opening the data file when `key` is not open.
    /// An unreadable index counts as not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the data file exists but cannot be inspected.
    pub fn is_cached(&self, key: &str) -> StoreResult<bool> {
        let paths = self.paths_for(key);
        if let Some(file) = self.inner.open.get(&paths.stem).and_then(|w| w.upgrade()) {
            return Ok(file.is_complete());
        }

        let snapshot = match IndexStore::new(&paths.index).load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(?e, key, "index unreadable, treating as not cached");
                return Ok(false);
            }
        };
        if !snapshot.completed {
            return Ok(false);
        }

        let cached_end = snapshot.fragments.last().map_or(0, |r| r.end());
        match fs::metadata(&paths.data) {
            Ok(meta) => Ok(meta.len() >= cached_end),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `key`'s files. Open handles for `key` become unusable.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be deleted.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        let paths = self.paths_for(key);

        match self.inner.open.entry(paths.stem.clone()) {
            Entry::Occupied(occupied) => {
                if let Some(file) = occupied.get().upgrade() {
                    file.remove_cache()?;
                } else {
                    remove_quiet(&paths.data)?;
                    remove_quiet(&paths.index)?;
                }
                occupied.remove();
            }
            Entry::Vacant(_vacant) => {
                remove_quiet(&paths.data)?;
                remove_quiet(&paths.index)?;
            }
        }

        tracing::debug!(key, stem = %paths.stem, "cache entry removed");
        Ok(())
    }

    /// Remove expired entries, then trim to half of `max_cache_size` if the
    /// cache is over it. Open entries are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned or a file cannot
    /// be deleted.
    pub fn delete_old_files(&self) -> StoreResult<EvictionReport> {
        let config = &self.inner.config;
        let entries = scan(&config.root_dir)?;
        let (victims, skipped_open) = select_victims(
            entries,
            SystemTime::now(),
            config.max_cache_age,
            config.max_cache_size,
            |stem| self.is_open(stem),
        );

        let mut report = EvictionReport {
            skipped_open,
            ..EvictionReport::default()
        };
        for victim in victims {
            if self.remove_closed_entry(&victim)? {
                report.removed += 1;
                report.freed_bytes = report.freed_bytes.saturating_add(victim.size);
            } else {
                report.skipped_open += 1;
            }
        }
        self.prune_registry();

        tracing::debug!(
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            skipped_open = report.skipped_open,
            "old cache files deleted"
        );
        Ok(report)
    }

    /// Remove every entry that is not open. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned or a file cannot
    /// be deleted.
    pub fn clear(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for entry in scan(self.root_dir())? {
            if self.remove_closed_entry(&entry)? {
                removed += 1;
            }
        }
        self.prune_registry();

        tracing::debug!(removed, "cache cleared");
        Ok(removed)
    }

    /// Delete `entry`'s files unless its key is open. Holds the registry slot
    /// so a concurrent `open_file` cannot race the deletion.
    fn remove_closed_entry(&self, entry: &CacheEntry) -> StoreResult<bool> {
        let slot = self.inner.open.entry(entry.stem.clone());
        if let Entry::Occupied(occupied) = &slot
            && occupied.get().is_alive()
        {
            return Ok(false);
        }
        for path in &entry.files {
            remove_quiet(path)?;
        }
        if let Entry::Occupied(occupied) = slot {
            occupied.remove();
        }
        Ok(true)
    }

    fn prune_registry(&self) {
        self.inner.open.retain(|_, weak| weak.is_alive());
    }

    /// Bytes used by all entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn size(&self) -> StoreResult<u64> {
        Ok(totals(&scan(self.root_dir())?).1)
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn count(&self) -> StoreResult<usize> {
        Ok(scan(self.root_dir())?.len())
    }

    /// `(count, size)` computed on the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned or the scan task
    /// dies.
    pub async fn calculate_size(&self) -> StoreResult<(usize, u64)> {
        let root = self.root_dir().to_path_buf();
        let entries = self
            .inner
            .config
            .pool
            .spawn_async(move || scan(&root))
            .await??;
        Ok(totals(&entries))
    }

    /// Whether `size` more bytes fit under `max_cache_size`.
    ///
    /// Always `true` without a size limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn has_free_space_for(&self, size: u64) -> StoreResult<bool> {
        let Some(limit) = self.inner.config.max_cache_size else {
            return Ok(true);
        };
        Ok(self.size()?.saturating_add(size) <= limit)
    }
}

fn totals(entries: &[CacheEntry]) -> (usize, u64) {
    let size = entries
        .iter()
        .map(|e| e.size)
        .fold(0u64, u64::saturating_add);
    (entries.len(), size)
}

fn remove_quiet(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn touch(path: &Path) {
    let result = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(?e, path = %path.display(), "failed to refresh modification time");
    }
}
