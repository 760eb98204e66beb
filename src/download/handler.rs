//! Session registry and shared worker pool.
//!
//! A [`DownloadHandler`] owns one multi-thread runtime and one HTTP client
//! for every session it starts. Chunk work from all sessions competes for a
//! single semaphore sized to the pool, so adding sessions never adds threads.
//!
//! # Example
//!
//! ```no_run
//! use durl::DownloadHandler;
//!
//! # fn example() -> Result<(), durl::DownloadError> {
//! let handler = DownloadHandler::create(4)?;
//! let key = handler.start("https://example.com/big.iso", "./big.iso", 4, 8 * 1024 * 1024)?;
//! loop {
//!     let state = handler.get_state(key)?;
//!     println!("{}/{:?}", state.downloaded_size, state.total_size);
//!     if state.state.is_terminal() {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(500));
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};
use url::Url;

use super::config::HandlerConfig;
use super::error::DownloadError;
use super::fetcher::build_client;
use super::filename::resolve_destination;
use super::planner::ChunkPlanner;
use super::progress::ChunkSnapshot;
use super::session::{DownloadSession, SessionState, StateSnapshot, WorkContext};

/// Owns the worker pool and every session started through it.
///
/// All methods take `&self` and may be called from any thread. Dropping the
/// handler cancels every session and shuts the pool down.
#[derive(Debug)]
pub struct DownloadHandler {
    runtime: Option<Runtime>,
    work: WorkContext,
    config: HandlerConfig,
    sessions: DashMap<u64, Arc<DownloadSession>>,
    next_key: AtomicU64,
}

impl DownloadHandler {
    /// Creates a handler with default timeouts and a pool of `thread_count`
    /// workers (`0` is clamped to `1`).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Pool`] if the worker threads cannot be spawned.
    pub fn create(thread_count: usize) -> Result<Self, DownloadError> {
        Self::with_config(HandlerConfig::with_thread_count(thread_count))
    }

    /// Creates a handler from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidInput`] if `config` fails validation,
    /// or [`DownloadError::Pool`] if the worker threads cannot be spawned.
    pub fn with_config(config: HandlerConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let threads = config.effective_thread_count();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("durl-worker")
            .enable_all()
            .build()
            .map_err(DownloadError::pool)?;

        let work = WorkContext {
            client: build_client(&config),
            permits: Arc::new(Semaphore::new(threads)),
            response_timeout: config.response_timeout(),
            read_timeout: config.read_timeout(),
        };
        info!(threads, "download handler created");

        Ok(Self {
            runtime: Some(runtime),
            work,
            config,
            sessions: DashMap::new(),
            next_key: AtomicU64::new(1),
        })
    }

    /// Starts downloading `url` into `path` and returns its key immediately.
    ///
    /// `path` may name a file (created or truncated) or an existing directory,
    /// in which case the file name comes from the URL. The resource is split
    /// into at most `task_count` chunks of about `block_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidInput`] without creating a session if
    /// the url is not an absolute `http`/`https` URL, the path is empty, the
    /// parent directory is missing or read-only, or either count is zero.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn start(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        task_count: u64,
        block_size: u64,
    ) -> Result<u64, DownloadError> {
        let url = parse_url(url)?;
        let destination = validate_destination(path.as_ref(), &url)?;
        let planner = ChunkPlanner::new(task_count, block_size)?;
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(DownloadError::invalid_input("handler has been released"));
        };

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let session = DownloadSession::new(key, url.as_str(), destination, planner);
        self.sessions.insert(key, Arc::clone(&session));
        runtime.spawn(session.run(self.work.clone()));

        info!(key, task_count, block_size, "download queued");
        Ok(key)
    }

    /// Whether the session is probing or transferring. `false` for unknown keys.
    #[must_use]
    pub fn is_downloading(&self, key: u64) -> bool {
        self.session(key)
            .is_ok_and(|session| session.state().is_downloading())
    }

    /// Whether the session finished successfully. `false` for unknown keys.
    #[must_use]
    pub fn is_finished(&self, key: u64) -> bool {
        self.session(key)
            .is_ok_and(|session| session.state() == SessionState::Finished)
    }

    /// Consistent snapshot of state, sizes, rate, and error.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn get_state(&self, key: u64) -> Result<StateSnapshot, DownloadError> {
        Ok(self.session(key)?.snapshot())
    }

    /// Full error message of the session; empty when it has no error.
    ///
    /// The byte length of the returned string equals
    /// [`StateSnapshot::error_len`].
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn get_error_string(&self, key: u64) -> Result<String, DownloadError> {
        Ok(self
            .session(key)?
            .snapshot()
            .error
            .map(|e| e.message)
            .unwrap_or_default())
    }

    /// Removes a terminal session from the registry. The downloaded file is
    /// never touched.
    ///
    /// Returns `Ok(false)` and leaves the session running if it is still
    /// active; call [`cancel`](Self::cancel) first to stop it.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    #[instrument(skip(self))]
    pub fn clean(&self, key: u64) -> Result<bool, DownloadError> {
        let state = self.session(key)?.state();
        if !state.is_terminal() {
            debug!(?state, "clean ignored for active download");
            return Ok(false);
        }
        self.sessions.remove(&key);
        debug!(?state, "download cleaned");
        Ok(true)
    }

    /// Cancels an active session, keeping its partial file.
    ///
    /// Returns `Ok(false)` if the session had already reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn cancel(&self, key: u64) -> Result<bool, DownloadError> {
        Ok(self.session(key)?.cancel())
    }

    /// Pauses the session's workers at their next I/O checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn suspend(&self, key: u64) -> Result<(), DownloadError> {
        self.session(key)?.suspend();
        Ok(())
    }

    /// Resumes a suspended session.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn resume(&self, key: u64) -> Result<(), DownloadError> {
        self.session(key)?.resume();
        Ok(())
    }

    /// Whether the session is suspended. `false` for unknown keys.
    #[must_use]
    pub fn is_suspended(&self, key: u64) -> bool {
        self.session(key)
            .is_ok_and(|session| session.is_suspended())
    }

    /// Source URL of the session.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn url(&self, key: u64) -> Result<String, DownloadError> {
        Ok(self.session(key)?.url().to_string())
    }

    /// Destination file of the session (resolved for directory targets).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn save_path(&self, key: u64) -> Result<PathBuf, DownloadError> {
        Ok(self.session(key)?.save_path().to_path_buf())
    }

    /// Per-chunk progress, empty until the session has been planned.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownKey`] if `key` is not registered.
    pub fn chunks(&self, key: u64) -> Result<Vec<ChunkSnapshot>, DownloadError> {
        Ok(self.session(key)?.chunks())
    }

    /// Keys of every registered session, ascending.
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.sessions.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();
        keys
    }

    /// Cancels every session and shuts the pool down.
    ///
    /// Blocks for up to `release_timeout_secs` while in-flight writes finish.
    /// Equivalent to dropping the handler.
    pub fn release(self) {
        drop(self);
    }

    fn session(&self, key: u64) -> Result<Arc<DownloadSession>, DownloadError> {
        self.sessions
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DownloadError::unknown_key(key))
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let cancelled = self
            .sessions
            .iter()
            .filter(|entry| entry.value().cancel())
            .count();
        self.work.permits.close();
        self.sessions.clear();

        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.config.release_timeout());
        }
        info!(cancelled, "download handler released");
    }
}

impl Drop for DownloadHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_url(raw: &str) -> Result<Url, DownloadError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::invalid_input("url must not be empty"));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| DownloadError::invalid_input(format!("malformed url '{trimmed}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::invalid_input(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DownloadError::invalid_input(format!(
            "url '{trimmed}' has no host"
        )));
    }
    Ok(url)
}

fn validate_destination(path: &Path, url: &Url) -> Result<PathBuf, DownloadError> {
    if path.as_os_str().is_empty() {
        return Err(DownloadError::invalid_input("path must not be empty"));
    }
    let destination = resolve_destination(path, url);
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let metadata = std::fs::metadata(&parent).map_err(|e| {
        DownloadError::invalid_input(format!(
            "parent directory '{}' is not accessible: {e}",
            parent.display()
        ))
    })?;
    if !metadata.is_dir() {
        return Err(DownloadError::invalid_input(format!(
            "'{}' is not a directory",
            parent.display()
        )));
    }
    if metadata.permissions().readonly() {
        return Err(DownloadError::invalid_input(format!(
            "parent directory '{}' is read-only",
            parent.display()
        )));
    }
    Ok(destination)
}
