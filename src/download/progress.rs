//! Lock-free progress accounting for a session and its chunks.
//!
//! Workers only ever add to counters; readers only ever load them, so a
//! query never waits on an in-flight write.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use super::planner::ChunkRange;

/// Sentinel stored while the resource size is unknown.
const UNKNOWN_SIZE: u64 = u64::MAX;

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Planned, not yet picked up by a worker.
    Pending,
    /// A worker is fetching it.
    Active,
    /// All bytes written.
    Done,
    /// The worker gave up on it.
    Failed,
}

impl ChunkState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Done => 2,
            Self::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Done,
            3 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Point-in-time view of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSnapshot {
    /// Byte range of the chunk.
    pub range: ChunkRange,
    /// Bytes written so far.
    pub downloaded: u64,
    /// Chunk lifecycle state.
    pub state: ChunkState,
}

#[derive(Debug)]
struct ChunkProgress {
    range: ChunkRange,
    downloaded: AtomicU64,
    state: AtomicU8,
}

/// Aggregates per-chunk byte counters into a session total.
#[derive(Debug)]
pub struct ProgressTracker {
    total_size: AtomicU64,
    downloaded: AtomicU64,
    window: AtomicU64,
    bytes_per_sec: AtomicU64,
    chunks: OnceLock<Vec<ChunkProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Creates a tracker with unknown size and no chunks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_size: AtomicU64::new(UNKNOWN_SIZE),
            downloaded: AtomicU64::new(0),
            window: AtomicU64::new(0),
            bytes_per_sec: AtomicU64::new(0),
            chunks: OnceLock::new(),
        }
    }

    /// Fixes the resource size.
    pub fn set_total(&self, total: u64) {
        self.total_size.store(total, Ordering::Release);
    }

    /// Resource size, once known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        match self.total_size.load(Ordering::Acquire) {
            UNKNOWN_SIZE => None,
            total => Some(total),
        }
    }

    /// Bytes written across all chunks.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Installs the planned chunks. Only the first call has an effect.
    pub fn install_chunks(&self, ranges: &[ChunkRange]) {
        let chunks = ranges
            .iter()
            .map(|range| ChunkProgress {
                range: *range,
                downloaded: AtomicU64::new(0),
                state: AtomicU8::new(ChunkState::Pending.to_u8()),
            })
            .collect();
        let _ = self.chunks.set(chunks);
    }

    /// Credits `bytes` written by the worker of chunk `index`.
    pub fn record(&self, index: usize, bytes: u64) {
        if let Some(chunk) = self.chunk(index) {
            chunk.downloaded.fetch_add(bytes, Ordering::AcqRel);
        }
        self.downloaded.fetch_add(bytes, Ordering::AcqRel);
        self.window.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Updates the lifecycle state of chunk `index`.
    pub fn set_chunk_state(&self, index: usize, state: ChunkState) {
        if let Some(chunk) = self.chunk(index) {
            chunk.state.store(state.to_u8(), Ordering::Release);
        }
    }

    /// Snapshots every planned chunk, in plan order.
    #[must_use]
    pub fn chunk_snapshots(&self) -> Vec<ChunkSnapshot> {
        self.chunks
            .get()
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|chunk| ChunkSnapshot {
                        range: chunk.range,
                        downloaded: chunk.downloaded.load(Ordering::Acquire),
                        state: ChunkState::from_u8(chunk.state.load(Ordering::Acquire)),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Closes the current rate window; called once per sample interval.
    pub fn sample_rate(&self) {
        let bytes = self.window.swap(0, Ordering::AcqRel);
        self.bytes_per_sec.store(bytes, Ordering::Release);
    }

    /// Clears the rate once the transfer has stopped.
    pub fn reset_rate(&self) {
        self.window.store(0, Ordering::Release);
        self.bytes_per_sec.store(0, Ordering::Release);
    }

    /// Bytes written during the last full sample interval.
    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec.load(Ordering::Acquire)
    }

    fn chunk(&self, index: usize) -> Option<&ChunkProgress> {
        self.chunks.get().and_then(|chunks| chunks.get(index))
    }
}
