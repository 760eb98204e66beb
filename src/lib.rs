//! durl: a segmented, multi-connection HTTP(S) download engine.
//!
//! The library fetches a single resource over several parallel byte-range
//! requests, writes each range directly into its slot of the destination
//! file, and exposes thread-safe progress and error queries while the
//! transfer runs.
//!
//! # Architecture
//!
//! - [`download::DownloadHandler`] - worker pool plus keyed session registry
//! - [`download::DownloadSession`] - probe, plan, fan out, settle
//! - [`download::ChunkPlanner`] - byte-range partitioning
//! - [`download::FileSink`] - concurrent positioned writes
//! - [`download::ProgressTracker`] - lock-free byte accounting
//!
//! The library emits `tracing` events but never installs a subscriber.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use download::{
    ChunkSnapshot, ChunkState, DownloadError, DownloadHandler, ErrorKind, HandlerConfig,
    SessionState, StateSnapshot,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
