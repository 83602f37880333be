#![forbid(unsafe_code)]

//! Mapping from cache keys to files.
//!
//! A key (usually the media URL) maps to `<root>/<stem>[.ext]` for data and
//! `<root>/<stem>.idx` for the index, where `stem` is the first 16 bytes of
//! `sha256(key)` in hex.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub(crate) const INDEX_EXTENSION: &str = "idx";
const STEM_LEN: usize = 32;
const MAX_EXTENSION_LEN: usize = 5;

/// Files backing one cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePaths {
    pub stem: String,
    pub data: PathBuf,
    pub index: PathBuf,
}

impl CachePaths {
    pub fn for_key(root: &Path, key: &str) -> Self {
        let stem = stem_for_key(key);
        let data = match key_extension(key) {
            Some(ext) => root.join(format!("{stem}.{ext}")),
            None => root.join(&stem),
        };
        let index = root.join(format!("{stem}.{INDEX_EXTENSION}"));
        Self { stem, data, index }
    }
}

#[must_use]
pub fn stem_for_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(&hash[..STEM_LEN / 2])
}

/// Extension of the key's last path segment, ignoring query and fragment.
///
/// Only short alphanumeric extensions are kept so odd URLs cannot inject
/// path syntax into file names.
fn key_extension(key: &str) -> Option<String> {
    let path = key.split(['?', '#']).next().unwrap_or(key);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (name, ext) = segment.rsplit_once('.')?;
    let valid = !name.is_empty()
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// Stem of a file created by this crate, `None` for foreign files.
pub(crate) fn stem_of_file_name(name: &str) -> Option<&str> {
    let stem = name.split('.').next()?;
    (stem.len() == STEM_LEN && stem.bytes().all(|b| b.is_ascii_hexdigit())).then_some(stem)
}
