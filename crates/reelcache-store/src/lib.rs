#![forbid(unsafe_code)]

//! # reelcache-store
//!
//! Keyed directory of [`RangeCacheFile`]s with age and size eviction.
//!
//! ## Key mapping
//!
//! A key (usually the media URL) maps to
//! - `<root_dir>/<stem>[.ext]`: media bytes
//! - `<root_dir>/<stem>.idx`: fragment index and response metadata
//!
//! where `stem = hex(sha256(key)[..16])` and `ext` is the key's own file
//! extension when it is short and alphanumeric.
//!
//! ## Sharing
//!
//! Opening a key that is already open in this process returns a handle onto
//! the same cache file, so a downloader and a player never race on two
//! independent copies of the same index.

mod cache;
mod config;
mod error;
mod evict;
mod key;

pub use cache::VideoCache;
pub use config::{CacheConfig, DEFAULT_MAX_CACHE_AGE};
pub use error::{StoreError, StoreResult};
pub use evict::EvictionReport;
pub use key::{CachePaths, stem_for_key};
pub use reelcache_storage::{
    ByteRange, CacheState, Gap, RangeCacheFile, ResponseHeaders, StorageError,
};
