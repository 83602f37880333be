#![forbid(unsafe_code)]

use thiserror::Error;

/// Result type used by `reelcache-storage`.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by cache files and their index.
///
/// Zero-length ranges are not errors: they are ignored where they appear.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("index encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("index decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("unsupported index version {0}")]
    UnsupportedIndexVersion(u32),

    #[error("cache file has been removed")]
    Removed,
}
