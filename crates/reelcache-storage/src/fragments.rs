#![forbid(unsafe_code)]

//! Coverage tracking for cached byte ranges.
//!
//! [`FragmentSet`] records which bytes of a single file are present on disk.
//! It is backed by [`rangemap::RangeSet`], which keeps entries sorted and
//! merges any two ranges that overlap or touch, so the set is always
//! maximally coalesced and independent of insertion order.

use std::{fmt, ops::Range};

use rangemap::RangeSet;

use crate::{ByteRange, Gap};

/// Sorted, coalesced set of cached byte ranges.
#[derive(Clone, Default)]
pub struct FragmentSet {
    ranges: RangeSet<u64>,
}

impl FragmentSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `range` as cached, merging it with every fragment it overlaps or
    /// touches. Empty ranges are ignored.
    pub fn add_range(&mut self, range: ByteRange) {
        let range = range.as_range();
        if range.is_empty() {
            return;
        }
        self.ranges.insert(range);
    }

    /// Covered prefix of `query`.
    ///
    /// Returns `None` when `query` is empty or its first byte is not cached.
    #[must_use]
    pub fn cached_subrange(&self, query: ByteRange) -> Option<ByteRange> {
        if query.is_empty() {
            return None;
        }
        let fragment = self.ranges.get(&query.offset)?;
        let end = fragment.end.min(query.end());
        Some(ByteRange::from_bounds(query.offset, end))
    }

    /// The whole fragment containing `position`, if any.
    #[must_use]
    pub fn fragment_containing(&self, position: u64) -> Option<ByteRange> {
        self.ranges.get(&position).cloned().map(ByteRange::from)
    }

    /// First uncached stretch at or after `position`.
    ///
    /// When `position` is cached the search starts at the end of its
    /// fragment. There is always a gap: if nothing is cached beyond the start
    /// point the result is [`Gap::Open`].
    #[must_use]
    pub fn first_gap_from(&self, position: u64) -> Gap {
        let start = self.ranges.get(&position).map_or(position, |r| r.end);
        if start == u64::MAX {
            return Gap::Open { offset: start };
        }
        match self.ranges.overlapping(&(start..u64::MAX)).next() {
            Some(next) => Gap::Bounded(ByteRange::from_bounds(start, next.start)),
            None => Gap::Open { offset: start },
        }
    }

    /// Uncached stretches inside `within`, in ascending order.
    #[must_use]
    pub fn gaps(&self, within: ByteRange) -> Vec<ByteRange> {
        if within.is_empty() {
            return Vec::new();
        }
        self.ranges
            .gaps(&within.as_range())
            .map(ByteRange::from)
            .collect()
    }

    /// Whether every byte of `range` is cached. Empty ranges are trivially covered.
    #[must_use]
    pub fn covers(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .get(&range.offset)
            .is_some_and(|r| r.end >= range.end())
    }

    /// Total number of cached bytes.
    #[must_use]
    pub fn covered_len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| r.end - r.start)
            .fold(0u64, u64::saturating_add)
    }

    /// Forget coverage at or beyond `len`.
    pub fn truncate(&mut self, len: u64) {
        if len < u64::MAX {
            self.ranges.remove(len..u64::MAX);
        }
    }

    /// Highest fragment; its end is the end of cached data.
    #[must_use]
    pub fn last(&self) -> Option<ByteRange> {
        self.ranges.last().cloned().map(ByteRange::from)
    }

    /// Fragments in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.ranges.iter().cloned().map(ByteRange::from)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl PartialEq for FragmentSet {
    fn eq(&self, other: &Self) -> bool {
        self.ranges.iter().eq(other.ranges.iter())
    }
}

impl Eq for FragmentSet {}

impl fmt::Debug for FragmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|r: &Range<u64>| r.start..r.end))
            .finish()
    }
}

impl FromIterator<ByteRange> for FragmentSet {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<ByteRange> for FragmentSet {
    fn extend<I: IntoIterator<Item = ByteRange>>(&mut self, iter: I) {
        for range in iter {
            self.add_range(range);
        }
    }
}
