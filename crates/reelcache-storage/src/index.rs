#![forbid(unsafe_code)]

//! Persistent index for one cache file.
//!
//! The index records which fragments of the data file are valid plus the
//! response metadata needed to serve them again. It is written crash-safely
//! (temp file in the same directory, then rename), so a reader sees either
//! the previous index or the new one. A missing or empty index file is a
//! fresh cache, not an error.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{ByteRange, FragmentSet, ResponseHeaders, StorageError, StorageResult};

const INDEX_VERSION: u32 = 2;

/// Response metadata recorded with a cache file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheFileMetadata {
    /// Expected length of the whole file. `0` until a response has been seen.
    pub file_length: u64,
    pub mime_type: Option<String>,
    pub headers: ResponseHeaders,
}

impl CacheFileMetadata {
    #[must_use]
    pub fn new(file_length: u64, headers: ResponseHeaders) -> Self {
        let mime_type = headers.mime_type().map(str::to_owned);
        Self {
            file_length,
            mime_type,
            headers,
        }
    }

    #[must_use]
    pub const fn is_file_length_valid(&self) -> bool {
        self.file_length > 0
    }
}

/// Everything an index file holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub fragments: FragmentSet,
    pub metadata: CacheFileMetadata,
    /// The whole file was cached at some point. Survives later length
    /// corrections; cleared only by deleting the files.
    pub completed: bool,
}

/// On-disk format.
#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    file_length: u64,
    fragments: Vec<(u64, u64)>,
    mime_type: Option<String>,
    headers: ResponseHeaders,
    completed: bool,
}

/// Reads and writes the index file of a single cache file.
#[derive(Clone, Debug)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the index. A missing or empty file yields an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(&self) -> StorageResult<IndexSnapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IndexSnapshot::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(IndexSnapshot::default());
        }

        let (file, _): (IndexFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
        if file.version != INDEX_VERSION {
            return Err(StorageError::UnsupportedIndexVersion(file.version));
        }

        Ok(IndexSnapshot {
            fragments: file
                .fragments
                .into_iter()
                .map(|(offset, length)| ByteRange::new(offset, length))
                .collect(),
            metadata: CacheFileMetadata {
                file_length: file.file_length,
                mime_type: file.mime_type,
                headers: file.headers,
            },
            completed: file.completed,
        })
    }

    /// Replace the index file with `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the temp-file write or the rename fails.
    /// The previous index stays intact in that case.
    pub fn save(&self, snapshot: &IndexSnapshot) -> StorageResult<()> {
        let IndexSnapshot {
            fragments,
            metadata,
            completed,
        } = snapshot;
        let file = IndexFile {
            version: INDEX_VERSION,
            file_length: metadata.file_length,
            fragments: fragments.iter().map(|r| (r.offset, r.length)).collect(),
            mime_type: metadata.mime_type.clone(),
            headers: metadata.headers.clone(),
            completed: *completed,
        };
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::legacy())?;

        // Same directory as the target so the rename cannot cross filesystems.
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::trace!(
            path = %self.path.display(),
            fragments = file.fragments.len(),
            "index saved"
        );
        Ok(())
    }

    /// Delete the index file. Missing files are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
