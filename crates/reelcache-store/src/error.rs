#![forbid(unsafe_code)]

use reelcache_storage::StorageError;
use thiserror::Error;

/// Cache directory errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type StoreResult<T> = Result<T, StoreError>;
