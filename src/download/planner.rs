//! Partitioning of a resource into chunk byte ranges.

use super::error::DownloadError;

/// A contiguous byte range `[start, end)` fetched by one worker.
///
/// `end` is `None` only for the single open-ended chunk used when the
/// resource size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position of the chunk in the plan.
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte of the range, if known.
    pub end: Option<u64>,
}

impl ChunkRange {
    /// Number of bytes in the range, if bounded.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Whether the range is bounded and holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// `Range` header value (inclusive end, as HTTP requires).
    #[must_use]
    pub fn range_header(&self) -> Option<String> {
        self.end
            .map(|end| format!("bytes={}-{}", self.start, end.saturating_sub(1)))
    }
}

/// Splits a resource into at most `task_count` chunks of about `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    task_count: u64,
    block_size: u64,
}

impl ChunkPlanner {
    /// Creates a planner.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidInput`] if either argument is zero.
    pub fn new(task_count: u64, block_size: u64) -> Result<Self, DownloadError> {
        if task_count == 0 {
            return Err(DownloadError::invalid_input("task_count must be at least 1"));
        }
        if block_size == 0 {
            return Err(DownloadError::invalid_input("block_size must be at least 1"));
        }
        Ok(Self {
            task_count,
            block_size,
        })
    }

    /// Produces the ordered, gap-free chunk list covering `[0, total_size)`.
    ///
    /// Without range support or a known size the whole resource is a single
    /// chunk. When `task_count` caps the chunk count below
    /// `ceil(total_size / block_size)`, chunks grow evenly past `block_size`;
    /// in every case the last chunk absorbs the remainder.
    #[must_use]
    pub fn plan(&self, total_size: Option<u64>, accepts_ranges: bool) -> Vec<ChunkRange> {
        let Some(total) = total_size else {
            return vec![ChunkRange {
                index: 0,
                start: 0,
                end: None,
            }];
        };
        if total == 0 {
            return Vec::new();
        }
        if !accepts_ranges {
            return vec![ChunkRange {
                index: 0,
                start: 0,
                end: Some(total),
            }];
        }

        let blocks = total.div_ceil(self.block_size);
        let count = blocks.min(self.task_count);
        let size = if blocks <= self.task_count {
            self.block_size
        } else {
            total / count
        };

        (0..count)
            .map(|i| {
                let start = i * size;
                let end = if i + 1 == count { total } else { start + size };
                ChunkRange {
                    index: usize::try_from(i).unwrap_or(usize::MAX),
                    start,
                    end: Some(end),
                }
            })
            .collect()
    }
}
