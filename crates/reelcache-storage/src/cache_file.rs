#![forbid(unsafe_code)]

//! Disk-backed, range-addressable cache file.
//!
//! A [`RangeCacheFile`] owns one data file (media bytes at their real
//! offsets, holes left sparse) and its index (fragments + response metadata).
//! A downloader stores bytes as they arrive while a player reads whatever is
//! already cached; both go through one lock that covers the fragment set, the
//! metadata and the file handle, so every seek+I/O pair is atomic and a new
//! fragment becomes visible only after its bytes are on disk.
//!
//! Opening a data file that is already open in this process returns another
//! handle onto the same instance, so two sessions never keep diverging
//! fragment sets for one file.
//!
//! Index writes are deferred to the configured [`ThreadPool`] and coalesced:
//! many `store_data` calls between two flushes produce one index write.
//! [`RangeCacheFile::synchronize`] writes it immediately, and the last handle
//! to drop flushes anything still pending.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    ptr,
    sync::{Arc, LazyLock, Weak},
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use reelcache_platform::{Mutex, ThreadPool};

use crate::{
    ByteRange, CacheFileMetadata, FragmentSet, Gap, IndexSnapshot, IndexStore, ResponseHeaders,
    StorageError, StorageResult,
};

/// Cache files open in this process, by canonical data path.
static OPEN_FILES: LazyLock<DashMap<PathBuf, OpenEntry>> = LazyLock::new(DashMap::new);

struct OpenEntry {
    owner: Weak<Owner>,
    /// Outlives `owner` while its close flush runs.
    shared: Weak<Shared>,
}

impl OpenEntry {
    fn new(owner: &Arc<Owner>) -> Self {
        Self {
            owner: Arc::downgrade(owner),
            shared: Arc::downgrade(&owner.shared),
        }
    }
}

/// Options for opening a [`RangeCacheFile`].
#[derive(Clone, Debug)]
pub struct CacheFileOptions {
    /// Media bytes.
    pub data_path: PathBuf,
    /// Fragment index and response metadata.
    pub index_path: PathBuf,
    /// Pool running deferred index writes.
    pub pool: ThreadPool,
}

impl CacheFileOptions {
    pub fn new(data_path: impl Into<PathBuf>, index_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            index_path: index_path.into(),
            pool: ThreadPool::global(),
        }
    }

    #[must_use]
    pub fn with_pool(mut self, pool: ThreadPool) -> Self {
        self.pool = pool;
        self
    }
}

/// Lifecycle of a cache file.
///
/// `Complete` is terminal for the lifetime of the files, across reopens: a
/// later response that disagrees about the length is reported by
/// [`RangeCacheFile::store_response_metadata`], not turned into a downgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    PartiallyCached,
    Complete,
}

struct State {
    file: File,
    fragments: FragmentSet,
    metadata: CacheFileMetadata,
    completed: bool,
    /// Bumped on every change that belongs in the index.
    generation: u64,
    flush_scheduled: bool,
    removed: bool,
}

impl State {
    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if !self.completed
            && self.metadata.is_file_length_valid()
            && self
                .fragments
                .covers(ByteRange::new(0, self.metadata.file_length))
        {
            self.completed = true;
            tracing::debug!(
                file_length = self.metadata.file_length,
                "cache file complete"
            );
        }
    }

    fn ensure_live(&self) -> StorageResult<()> {
        if self.removed {
            return Err(StorageError::Removed);
        }
        Ok(())
    }

    fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            fragments: self.fragments.clone(),
            metadata: self.metadata.clone(),
            completed: self.completed,
        }
    }
}

struct Shared {
    data_path: PathBuf,
    index: IndexStore,
    pool: ThreadPool,
    state: Mutex<State>,
    /// Second handle onto the data file, synced without holding `state`.
    sync_handle: File,
    /// Serializes index writes. Holds the generation last written.
    ///
    /// Lock order: `persisted` before `state`.
    persisted: Mutex<u64>,
}

impl Shared {
    /// Write the index if it is behind the in-memory state.
    fn flush(&self) -> StorageResult<()> {
        let mut persisted = self.persisted.lock();

        let (generation, snapshot) = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            if state.removed || state.generation == *persisted {
                return Ok(());
            }
            (state.generation, state.snapshot())
        };

        // Bytes must reach the disk before an index that vouches for them.
        self.sync_handle.sync_data()?;
        self.index.save(&snapshot)?;
        *persisted = generation;
        Ok(())
    }

    fn flush_on_close(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!(
                ?e,
                path = %self.index.path().display(),
                "index flush on close failed"
            );
        }
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut State) {
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;

        let weak = Arc::downgrade(self);
        self.pool.spawn_io(
            "deferred index flush",
            self.index.path().to_path_buf(),
            // Last handle gone; it flushed on drop.
            move || weak.upgrade().map_or(Ok(()), |shared| shared.flush()),
        );
    }

    fn is_removed(&self) -> bool {
        self.state.lock().removed
    }
}

/// Keeps the files open. Dropped with the last [`RangeCacheFile`] handle.
///
/// Pool tasks reach [`Shared`] through a `Weak` and never hold an `Owner`,
/// so a [`WeakRangeCacheFile`] is alive exactly while user handles are.
struct Owner {
    /// Key in [`OPEN_FILES`].
    key: PathBuf,
    shared: Arc<Shared>,
}

impl Owner {
    fn load(
        key: PathBuf,
        data_path: PathBuf,
        index_path: PathBuf,
        pool: ThreadPool,
        file: File,
    ) -> StorageResult<Arc<Self>> {
        let disk_len = file.metadata()?.len();
        let sync_handle = file.try_clone()?;

        let index = IndexStore::new(index_path);
        let IndexSnapshot {
            mut fragments,
            metadata,
            mut completed,
        } = index.load().unwrap_or_else(|e| {
            tracing::warn!(?e, path = %index.path().display(), "index unreadable, starting empty");
            IndexSnapshot::default()
        });

        let mut generation = 0;
        let claimed_end = fragments.last().map_or(0, |r| r.end());
        if claimed_end > disk_len {
            tracing::warn!(
                claimed_end,
                disk_len,
                path = %data_path.display(),
                "index claims bytes beyond data file, trimming"
            );
            fragments.truncate(disk_len);
            completed = false;
            generation = 1;
        }
        completed |= metadata.is_file_length_valid()
            && fragments.covers(ByteRange::new(0, metadata.file_length));

        let snapshot = IndexSnapshot {
            fragments,
            metadata,
            completed,
        };
        if !index.path().exists() {
            index.save(&snapshot)?;
        }

        tracing::debug!(
            path = %data_path.display(),
            fragments = snapshot.fragments.len(),
            file_length = snapshot.metadata.file_length,
            completed,
            "cache file opened"
        );

        let state = State {
            file,
            fragments: snapshot.fragments,
            metadata: snapshot.metadata,
            completed,
            generation,
            flush_scheduled: false,
            removed: false,
        };
        let shared = Arc::new(Shared {
            data_path,
            index,
            pool,
            state: Mutex::new(state),
            sync_handle,
            persisted: Mutex::new(0),
        });
        Ok(Arc::new(Self { key, shared }))
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        // Waits for an in-flight deferred write, then writes what is left.
        self.shared.flush_on_close();
        OPEN_FILES.remove_if(&self.key, |_, entry| entry.owner.strong_count() == 0);
    }
}

/// Handle onto a cached file.
///
/// Handles created with [`share`](Self::share), or by opening the same data
/// file again, wrap the same files and the same lock but keep their own read
/// cursor.
pub struct RangeCacheFile {
    owner: Arc<Owner>,
    read_offset: Mutex<u64>,
}

impl fmt::Debug for RangeCacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeCacheFile")
            .field("data_path", &self.shared().data_path)
            .field("index_path", &self.shared().index.path())
            .field("read_offset", &*self.read_offset.lock())
            .finish_non_exhaustive()
    }
}

impl RangeCacheFile {
    fn shared(&self) -> &Arc<Shared> {
        &self.owner.shared
    }

    fn from_owner(owner: Arc<Owner>) -> Self {
        Self {
            owner,
            read_offset: Mutex::new(0),
        }
    }

    /// Open the cache file, creating the data and index files if absent.
    ///
    /// If the data file is already open in this process the result is a new
    /// handle onto that instance, and the index path and pool it was first
    /// opened with stay in effect.
    ///
    /// An unreadable index is not fatal: the file starts out empty and the
    /// cached bytes get downloaded again. Fragments the index claims beyond
    /// the physical end of the data file are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the data file cannot be opened or created, or the
    /// initial index cannot be written.
    pub fn open(options: CacheFileOptions) -> StorageResult<Self> {
        let CacheFileOptions {
            data_path,
            index_path,
            pool,
        } = options;

        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        let key = fs::canonicalize(&data_path)?;

        // A removed owner is dropped only after the slot is released; its
        // drop takes the slot again.
        let mut retired = None;
        let owner = match OPEN_FILES.entry(key.clone()) {
            Entry::Occupied(mut slot) => match slot.get().owner.upgrade() {
                Some(owner) if !owner.shared.is_removed() => owner,
                stale => {
                    // The last handle may be closing; its changes land first.
                    if stale.is_none()
                        && let Some(closing) = slot.get().shared.upgrade()
                    {
                        closing.flush_on_close();
                    }
                    retired = stale;
                    let owner = Owner::load(key, data_path, index_path, pool, file)?;
                    slot.insert(OpenEntry::new(&owner));
                    owner
                }
            },
            Entry::Vacant(slot) => {
                let owner = Owner::load(key, data_path, index_path, pool, file)?;
                slot.insert(OpenEntry::new(&owner));
                owner
            }
        };
        drop(retired);

        Ok(Self::from_owner(owner))
    }

    /// A second handle onto the same files, with its own read cursor at 0.
    #[must_use]
    pub fn share(&self) -> Self {
        Self::from_owner(Arc::clone(&self.owner))
    }

    /// Non-owning reference; see [`WeakRangeCacheFile::upgrade`].
    #[must_use]
    pub fn downgrade(&self) -> WeakRangeCacheFile {
        WeakRangeCacheFile {
            owner: Arc::downgrade(&self.owner),
        }
    }

    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.shared().data_path
    }

    #[must_use]
    pub fn index_path(&self) -> &Path {
        self.shared().index.path()
    }

    // -- store --

    /// Write `data` at `offset` and mark it cached.
    ///
    /// The new fragment is visible to queries when this returns. With
    /// `synchronize` the index is written before returning; otherwise the
    /// write is deferred and coalesced.
    ///
    /// # Errors
    ///
    /// Returns an error if the range overflows, the write fails, or (with
    /// `synchronize`) the index cannot be saved.
    pub fn store_data(&self, data: &[u8], offset: u64, synchronize: bool) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        offset
            .checked_add(len)
            .ok_or(StorageError::InvalidRange {
                start: offset,
                end: u64::MAX,
            })?;

        {
            let mut state = self.shared().state.lock();
            state.ensure_live()?;

            state.file.seek(SeekFrom::Start(offset))?;
            state.file.write_all(data)?;
            state.fragments.add_range(ByteRange::new(offset, len));
            state.touch();

            if !synchronize {
                self.shared().schedule_flush(&mut state);
            }
        }

        if synchronize {
            self.synchronize()?;
        }
        Ok(())
    }

    /// Record the response that is feeding this file.
    ///
    /// The first call stores `total_length` and `headers`. Later calls with
    /// the same length change nothing. A later call with a different length
    /// overwrites the length, keeps the first headers and returns `false` so
    /// the caller can drop assumptions built on the old length.
    pub fn store_response_metadata(&self, total_length: u64, headers: ResponseHeaders) -> bool {
        let mut state = self.shared().state.lock();
        let current = state.metadata.file_length;

        let consistent = if !state.metadata.is_file_length_valid() {
            state.metadata = CacheFileMetadata::new(total_length, headers);
            true
        } else if current == total_length {
            return true;
        } else {
            tracing::warn!(
                old = current,
                new = total_length,
                path = %self.shared().data_path.display(),
                "content length changed between responses"
            );
            state.metadata.file_length = total_length;
            false
        };

        state.touch();
        self.shared().schedule_flush(&mut state);
        consistent
    }

    /// Write the index now.
    ///
    /// # Errors
    ///
    /// Returns an error if the data file cannot be synced or the index
    /// cannot be saved.
    pub fn synchronize(&self) -> StorageResult<()> {
        self.shared().flush()
    }

    // -- read --

    /// Bytes of `range` present in the data file.
    ///
    /// The result is cut at the physical end of the data file. Holes inside
    /// the file read as zeros, so check [`cached_subrange`](Self::cached_subrange)
    /// first to know how much of the result is real.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has been removed.
    pub fn read_data(&self, range: ByteRange) -> StorageResult<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let mut state = self.shared().state.lock();
        state.ensure_live()?;

        let disk_len = state.file.metadata()?.len();
        if range.offset >= disk_len {
            return Ok(Bytes::new());
        }
        let end = range.end().min(disk_len);
        let len = usize::try_from(end - range.offset).map_err(|_| StorageError::InvalidRange {
            start: range.offset,
            end,
        })?;

        let mut buf = vec![0u8; len];
        state.file.seek(SeekFrom::Start(range.offset))?;
        state.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Read up to `len` bytes at the read cursor and advance it by what was read.
    ///
    /// # Errors
    ///
    /// Same as [`read_data`](Self::read_data).
    pub fn read_data_with_length(&self, len: usize) -> StorageResult<Bytes> {
        let mut cursor = self.read_offset.lock();
        let data = self.read_data(ByteRange::new(*cursor, len as u64))?;
        *cursor += data.len() as u64;
        Ok(data)
    }

    // -- seek --

    pub fn seek_to(&self, position: u64) {
        *self.read_offset.lock() = position;
    }

    /// Move the read cursor to the expected end of file, or to the end of
    /// cached data while the length is unknown. Returns the new position.
    pub fn seek_to_end(&self) -> u64 {
        let mut cursor = self.read_offset.lock();
        let end = {
            let state = self.shared().state.lock();
            if state.metadata.is_file_length_valid() {
                state.metadata.file_length
            } else {
                state.fragments.last().map_or(0, |r| r.end())
            }
        };
        *cursor = end;
        end
    }

    #[must_use]
    pub fn read_offset(&self) -> u64 {
        *self.read_offset.lock()
    }

    /// Read cursor sits at (or past) the known end of file.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        let cursor = self.read_offset.lock();
        let state = self.shared().state.lock();
        state.metadata.is_file_length_valid() && *cursor >= state.metadata.file_length
    }

    // -- coverage --

    /// Covered prefix of `range`, `None` if its first byte is not cached.
    #[must_use]
    pub fn cached_subrange(&self, range: ByteRange) -> Option<ByteRange> {
        self.shared().state.lock().fragments.cached_subrange(range)
    }

    /// The cached fragment containing `position`.
    #[must_use]
    pub fn cached_range_containing(&self, position: u64) -> Option<ByteRange> {
        self.shared()
            .state
            .lock()
            .fragments
            .fragment_containing(position)
    }

    /// First missing stretch at or after `position`.
    ///
    /// With a known file length the gap is bounded by it and `None` means
    /// nothing is missing from `position` to the end. With an unknown length
    /// the trailing gap is [`Gap::Open`].
    #[must_use]
    pub fn first_gap_from(&self, position: u64) -> Option<Gap> {
        let state = self.shared().state.lock();
        let gap = state.fragments.first_gap_from(position);
        if !state.metadata.is_file_length_valid() {
            return Some(gap);
        }
        gap.clamp(state.metadata.file_length).map(Gap::Bounded)
    }

    /// Snapshot of the fragment set.
    #[must_use]
    pub fn fragments(&self) -> FragmentSet {
        self.shared().state.lock().fragments.clone()
    }

    /// Total number of cached bytes.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.shared().state.lock().fragments.covered_len()
    }

    // -- metadata --

    #[must_use]
    pub fn metadata(&self) -> CacheFileMetadata {
        self.shared().state.lock().metadata.clone()
    }

    /// Expected file length, `0` while unknown.
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.shared().state.lock().metadata.file_length
    }

    #[must_use]
    pub fn is_file_length_valid(&self) -> bool {
        self.shared().state.lock().metadata.is_file_length_valid()
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        let state = self.shared().state.lock();
        if state.completed {
            CacheState::Complete
        } else if state.fragments.is_empty() {
            CacheState::Empty
        } else {
            CacheState::PartiallyCached
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shared().state.lock().completed
    }

    // -- remove --

    /// Delete the data and index files.
    ///
    /// Every handle onto these files becomes unusable: stores and reads
    /// return [`StorageError::Removed`]. Open a new instance to start over.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists and cannot be deleted.
    pub fn remove_cache(&self) -> StorageResult<()> {
        // Wait out an in-flight index write so it cannot recreate the file.
        let _persisted = self.shared().persisted.lock();
        {
            let mut state = self.shared().state.lock();
            state.removed = true;
        }
        OPEN_FILES.remove_if(&self.owner.key, |_, entry| {
            ptr::eq(entry.owner.as_ptr(), Arc::as_ptr(&self.owner))
        });

        match fs::remove_file(&self.shared().data_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.shared().index.remove()?;

        tracing::debug!(path = %self.shared().data_path.display(), "cache file removed");
        Ok(())
    }
}

/// Non-owning reference to a [`RangeCacheFile`]'s shared state.
#[derive(Clone, Debug, Default)]
pub struct WeakRangeCacheFile {
    owner: Weak<Owner>,
}

impl WeakRangeCacheFile {
    /// A new handle if any handle onto the files is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<RangeCacheFile> {
        self.owner.upgrade().map(RangeCacheFile::from_owner)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}
