//! Segmented HTTP download engine.
//!
//! A [`DownloadHandler`] owns a fixed worker pool and a registry of keyed
//! sessions. Each session probes the resource, splits it into byte ranges,
//! and fetches those ranges in parallel straight into the destination file.
//!
//! # Features
//!
//! - Parallel `Range` requests over one shared HTTP client
//! - Positioned writes into a preallocated file (no temp file, no rename)
//! - Lock-free progress counters readable while transfers run
//! - First-failure-wins error capture with a stable terminal state
//! - Suspend, resume, and cancel per session
//!
//! # Example
//!
//! ```no_run
//! use durl::download::{DownloadHandler, SessionState};
//!
//! # fn example() -> Result<(), durl::DownloadError> {
//! let handler = DownloadHandler::create(8)?;
//! let key = handler.start("https://example.com/data.tar", "/tmp", 8, 4 * 1024 * 1024)?;
//! loop {
//!     let state = handler.get_state(key)?;
//!     if state.state.is_terminal() {
//!         assert_eq!(state.state, SessionState::Finished, "{}", handler.get_error_string(key)?);
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(200));
//! }
//! handler.clean(key)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
mod error;
mod fetcher;
mod filename;
mod handler;
mod planner;
mod progress;
mod session;
mod sink;

pub use config::HandlerConfig;
pub use error::{DownloadError, ErrorKind};
pub use handler::DownloadHandler;
pub use planner::{ChunkPlanner, ChunkRange};
pub use progress::{ChunkSnapshot, ChunkState, ProgressTracker};
pub use session::{DownloadSession, SessionError, SessionState, StateSnapshot};
pub use sink::FileSink;
