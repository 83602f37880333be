#![forbid(unsafe_code)]

use std::{fmt, ops::Range};

use serde::{Deserialize, Serialize};

/// Half-open byte interval `[offset, offset + length)` inside one cached file.
///
/// Lengths of zero are legal values but never describe coverage: they are
/// dropped by [`FragmentSet::add_range`](crate::FragmentSet::add_range) and
/// never returned from a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Range between two absolute positions. `end < start` yields an empty range.
    #[must_use]
    pub const fn from_bounds(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            length: end.saturating_sub(start),
        }
    }

    /// Exclusive end position, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[must_use]
    pub const fn contains(&self, position: u64) -> bool {
        position >= self.offset && position < self.end()
    }

    #[must_use]
    pub const fn as_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

impl From<Range<u64>> for ByteRange {
    fn from(range: Range<u64>) -> Self {
        Self::from_bounds(range.start, range.end)
    }
}

impl From<ByteRange> for Range<u64> {
    fn from(range: ByteRange) -> Self {
        range.as_range()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

/// An uncached stretch of a file.
///
/// Coverage alone cannot know where a file ends, so the gap after the last
/// fragment is [`Gap::Open`]. Callers that know the expected length turn it
/// into a bounded range with [`Gap::clamp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gap {
    /// Missing bytes followed by cached data (or by the known end of file).
    Bounded(ByteRange),
    /// Everything from `offset` onwards is missing.
    Open { offset: u64 },
}

impl Gap {
    /// First missing byte.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Bounded(range) => range.offset,
            Self::Open { offset } => *offset,
        }
    }

    /// Bound the gap by `file_length`.
    ///
    /// Returns `None` when the gap starts at or beyond `file_length`.
    #[must_use]
    pub fn clamp(self, file_length: u64) -> Option<ByteRange> {
        let (start, end) = match self {
            Self::Bounded(range) => (range.offset, range.end().min(file_length)),
            Self::Open { offset } => (offset, file_length),
        };
        (start < end).then(|| ByteRange::from_bounds(start, end))
    }
}
