#![forbid(unsafe_code)]

//! HTTP response headers as stored next to cached bytes.
//!
//! Header names are kept as received; lookups are case-insensitive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Response header map persisted with a cache file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeaders {
    entries: BTreeMap<String, String>,
}

impl ResponseHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any value stored under the same name in
    /// another case.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.entries.insert(name, value.into());
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full length of the resource.
    ///
    /// Taken from the total in `Content-Range: bytes a-b/TOTAL` when present
    /// (a ranged response's `Content-Length` only counts the slice), otherwise
    /// from `Content-Length`.
    #[must_use]
    pub fn total_length(&self) -> Option<u64> {
        if let Some(range) = self.get("content-range") {
            return parse_content_range_total(range);
        }
        self.get("content-length")?.trim().parse().ok()
    }

    /// Whether the server answers byte-range requests.
    #[must_use]
    pub fn supports_byte_ranges(&self) -> bool {
        if self.get("content-range").is_some() {
            return true;
        }
        self.get("accept-ranges")
            .is_some_and(|v| v.split(',').any(|u| u.trim().eq_ignore_ascii_case("bytes")))
    }

    /// `Content-Type` without parameters.
    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        let value = self.get("content-type")?;
        let mime = value.split(';').next().unwrap_or(value).trim();
        (!mime.is_empty()).then_some(mime)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResponseHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// `bytes 0-1023/146515` -> `146515`. `*` totals are unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
