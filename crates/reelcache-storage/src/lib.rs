#![forbid(unsafe_code)]

//! `reelcache-storage`
//!
//! Range-addressable cache files for progressively downloaded media.
//!
//! - [`FragmentSet`]: which byte ranges of a file are cached
//! - [`IndexStore`]: crash-safe persistence of fragments and response metadata
//! - [`RangeCacheFile`]: data file + index, shared by a writer and readers

mod cache_file;
mod error;
mod fragments;
mod index;
mod range;
mod response;

pub use cache_file::{CacheFileOptions, CacheState, RangeCacheFile, WeakRangeCacheFile};
pub use error::{StorageError, StorageResult};
pub use fragments::FragmentSet;
pub use index::{CacheFileMetadata, IndexSnapshot, IndexStore};
pub use range::{ByteRange, Gap};
pub use response::ResponseHeaders;
