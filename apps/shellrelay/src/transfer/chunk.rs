use std::fmt;

use super::TransferError;

/// Half-open byte range `[start, end)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `Content-Range` value for this chunk. Empty ranges have no inclusive
    /// form, so they use the unsatisfied-range syntax.
    pub fn content_range(&self, total: u64) -> String {
        if self.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{}", self.start, self.end - 1, total)
        }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

pub fn next_boundary(offset: u64, chunk_size: u64, total: u64) -> ChunkRange {
    let start = offset.min(total);
    ChunkRange {
        start,
        end: start.saturating_add(chunk_size).min(total),
    }
}

pub fn is_final(_start: u64, end: u64, total: u64) -> bool {
    end >= total
}

/// Percent complete after a chunk starting at `offset` succeeds, floored.
pub fn progress_percent(offset: u64, chunk_size: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let uploaded = u128::from(offset) + u128::from(chunk_size);
    (uploaded * 100 / u128::from(total)).min(100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    total: u64,
    chunk_size: u64,
}

impl ChunkPlanner {
    pub fn new(total: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self { total, chunk_size })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn first(&self) -> ChunkRange {
        next_boundary(0, self.chunk_size, self.total)
    }

    /// The range that follows `range`, or `None` once `range` was final.
    pub fn after(&self, range: ChunkRange) -> Option<ChunkRange> {
        if self.is_final(range) {
            None
        } else {
            Some(next_boundary(range.end, self.chunk_size, self.total))
        }
    }

    pub fn is_final(&self, range: ChunkRange) -> bool {
        is_final(range.start, range.end, self.total)
    }

    pub fn percent_after(&self, range: ChunkRange) -> u8 {
        progress_percent(range.start, self.chunk_size, self.total)
    }

    pub fn chunk_count(&self) -> u64 {
        self.total.div_ceil(self.chunk_size).max(1)
    }

    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        std::iter::successors(Some(self.first()), move |range| self.after(*range))
    }
}
