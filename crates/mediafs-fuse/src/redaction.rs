//! Byte-range redaction for open file handles.
//!
//! A [`RedactionInfo`] is built once at open time from the flat offset array
//! handed back by the access-control collaborator and is immutable afterwards,
//! so the read path can consult it without any locking.

use crate::error::{FuseError, Result};

/// Half-open byte interval `[start, end)` that must be hidden from a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RedactionRange {
    /// First hidden byte.
    pub start: u64,
    /// One past the last hidden byte.
    pub end: u64,
}

impl RedactionRange {
    /// Range `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        RedactionRange { start, end }
    }

    /// Bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers nothing.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && self.end > start
    }
}

impl From<(u64, u64)> for RedactionRange {
    fn from((start, end): (u64, u64)) -> Self {
        RedactionRange { start, end }
    }
}

/// One piece of a split read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    /// Offset of the piece.
    pub start: u64,
    /// Bytes in the piece.
    pub size: u64,
    /// Whether the piece is served as zeros.
    pub is_redacted: bool,
}

impl ReadRange {
    /// One past the last byte of the piece.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Sorted, coalesced set of redaction ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedactionInfo {
    ranges: Vec<RedactionRange>,
}

impl RedactionInfo {
    /// No redaction at all.
    pub fn none() -> Self {
        RedactionInfo { ranges: Vec::new() }
    }

    /// Builds from a flat `[start0, end0, start1, end1, ...]` array.
    pub fn new(offsets: &[u64]) -> Result<Self> {
        if offsets.len() % 2 != 0 {
            return Err(FuseError::InvalidArgument {
                msg: format!("odd redaction offset count: {}", offsets.len()),
            });
        }
        let mut ranges = Vec::with_capacity(offsets.len() / 2);
        for pair in offsets.chunks_exact(2) {
            if pair[0] > pair[1] {
                return Err(FuseError::InvalidArgument {
                    msg: format!("redaction range start {} > end {}", pair[0], pair[1]),
                });
            }
            ranges.push(RedactionRange::new(pair[0], pair[1]));
        }
        Ok(Self::from_ranges(ranges))
    }

    /// Sorts and merges the given ranges. Touching ranges are merged too.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<RedactionRange>,
    {
        let mut sorted: Vec<RedactionRange> = ranges
            .into_iter()
            .map(Into::into)
            .filter(|r| !r.is_empty())
            .collect();
        sorted.sort();

        let mut merged: Vec<RedactionRange> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        RedactionInfo { ranges: merged }
    }

    /// Whether any byte is hidden.
    pub fn is_redaction_needed(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Number of stored (merged) ranges.
    pub fn size(&self) -> usize {
        self.ranges.len()
    }

    /// Merged ranges in ascending order.
    pub fn ranges(&self) -> &[RedactionRange] {
        &self.ranges
    }

    /// Whether `[offset, offset + size)` touches any redacted byte.
    pub fn overlaps(&self, size: u64, offset: u64) -> bool {
        !self.overlapping(size, offset).is_empty()
    }

    /// Stored ranges intersecting `[offset, offset + size)`, unclipped.
    pub fn get_overlapping_redaction_ranges(&self, size: u64, offset: u64) -> Vec<RedactionRange> {
        self.overlapping(size, offset).to_vec()
    }

    fn overlapping(&self, size: u64, offset: u64) -> &[RedactionRange] {
        if size == 0 {
            return &[];
        }
        let end = offset.saturating_add(size);
        let first = self.ranges.partition_point(|r| r.end <= offset);
        let len = self.ranges[first..]
            .iter()
            .take_while(|r| r.overlaps(offset, end))
            .count();
        &self.ranges[first..first + len]
    }

    /// Splits a read into consecutive redacted and pass-through pieces that
    /// exactly cover `[offset, offset + size)`.
    pub fn split_read(&self, offset: u64, size: u64) -> Vec<ReadRange> {
        let end = offset.saturating_add(size);
        let mut pieces = Vec::new();
        let mut cursor = offset;

        for range in self.overlapping(size, offset) {
            let start = range.start.max(offset);
            let stop = range.end.min(end);
            if start > cursor {
                pieces.push(ReadRange {
                    start: cursor,
                    size: start - cursor,
                    is_redacted: false,
                });
            }
            pieces.push(ReadRange {
                start,
                size: stop - start,
                is_redacted: true,
            });
            cursor = stop;
        }

        if cursor < end {
            pieces.push(ReadRange {
                start: cursor,
                size: end - cursor,
                is_redacted: false,
            });
        }
        pieces
    }
}
