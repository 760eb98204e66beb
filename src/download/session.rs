//! One logical download: probe, plan, fan out chunk workers, settle state.
//!
//! # State machine
//!
//! ```text
//! Pending -> Probing -> Downloading -> Finished
//!                  \            \----> Error
//!                   \----------------> Error
//! (any non-terminal) ----------------> Cancelled
//! ```
//!
//! All transitions go through one small mutex that also guards the captured
//! error, so the first failure wins and a terminal state never changes.
//! Byte counters live in the [`ProgressTracker`] and are lock-free.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Client;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::RATE_SAMPLE_INTERVAL;
use super::error::{DownloadError, ErrorKind};
use super::fetcher::{FetchOutcome, RangeFetcher, probe};
use super::planner::{ChunkPlanner, ChunkRange};
use super::progress::{ChunkSnapshot, ChunkState, ProgressTracker};
use super::sink::FileSink;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet scheduled.
    Pending,
    /// Discovering size and range support.
    Probing,
    /// Chunks dispatched to workers.
    Downloading,
    /// Every chunk written; the file holds `total_size` bytes.
    Finished,
    /// A chunk or the probe failed; the partial file is kept.
    Error,
    /// Released while active; the partial file is kept.
    Cancelled,
}

impl SessionState {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Whether the session is probing or transferring.
    #[must_use]
    pub fn is_downloading(self) -> bool {
        matches!(self, Self::Probing | Self::Downloading)
    }
}

/// Terminal error captured from the first failing chunk (or the probe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Taxonomy bucket of the failure.
    pub kind: ErrorKind,
    /// Full, untruncated description.
    pub message: String,
}

impl From<&DownloadError> for SessionError {
    fn from(error: &DownloadError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Consistent point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// Resource size, once known.
    pub total_size: Option<u64>,
    /// Bytes written to disk so far.
    pub downloaded_size: u64,
    /// Bytes written during the last sample interval.
    pub bytes_per_sec: u64,
    /// Captured error; present iff `state == Error`.
    pub error: Option<SessionError>,
}

impl StateSnapshot {
    /// Byte length of the error message, `0` when there is none.
    #[must_use]
    pub fn error_len(&self) -> usize {
        self.error.as_ref().map_or(0, |e| e.message.len())
    }

    /// Numeric error code, `0` when there is none.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(0, |e| e.kind.code())
    }

    /// Completion in percent (two decimals); `0.0` while the size is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_complete(&self) -> f64 {
        match self.total_size {
            Some(0) if self.state == SessionState::Finished => 100.0,
            Some(total) if total > 0 => {
                let percent = self.downloaded_size as f64 / total as f64 * 100.0;
                (percent * 100.0).round() / 100.0
            }
            _ => 0.0,
        }
    }
}

/// Pool-wide resources a session's tasks run with.
#[derive(Debug, Clone)]
pub(crate) struct WorkContext {
    pub(crate) client: Client,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) response_timeout: std::time::Duration,
    pub(crate) read_timeout: std::time::Duration,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    error: Option<SessionError>,
}

/// A single keyed download owned by the registry.
#[derive(Debug)]
pub struct DownloadSession {
    key: u64,
    url: Arc<str>,
    path: PathBuf,
    planner: ChunkPlanner,
    status: Mutex<Status>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl DownloadSession {
    pub(crate) fn new(key: u64, url: &str, path: PathBuf, planner: ChunkPlanner) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            key,
            url: Arc::from(url),
            path,
            planner,
            status: Mutex::new(Status {
                state: SessionState::Pending,
                error: None,
            }),
            tracker: Arc::new(ProgressTracker::new()),
            cancel: CancellationToken::new(),
            paused,
        })
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Destination file.
    #[must_use]
    pub fn save_path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_status().state
    }

    /// Consistent snapshot of state, sizes, rate, and error.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let status = self.lock_status();
        StateSnapshot {
            state: status.state,
            total_size: self.tracker.total(),
            downloaded_size: self.tracker.downloaded(),
            bytes_per_sec: self.tracker.bytes_per_sec(),
            error: status.error.clone(),
        }
    }

    /// Per-chunk progress, empty until planning completes.
    #[must_use]
    pub fn chunks(&self) -> Vec<ChunkSnapshot> {
        self.tracker.chunk_snapshots()
    }

    /// Moves a non-terminal session to `Cancelled` and signals its workers.
    ///
    /// Returns `false` if the session had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        let mut status = self.lock_status();
        if status.state.is_terminal() {
            return false;
        }
        status.state = SessionState::Cancelled;
        drop(status);
        self.cancel.cancel();
        info!(key = self.key, "download cancelled");
        true
    }

    /// Pauses workers at their next I/O checkpoint.
    pub fn suspend(&self) {
        self.paused.send_replace(true);
        debug!(key = self.key, "download suspended");
    }

    /// Lets paused workers continue.
    pub fn resume(&self) {
        self.paused.send_replace(false);
        debug!(key = self.key, "download resumed");
    }

    /// Whether the session is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.paused.borrow()
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let mut status = self.lock_status();
        if status.state != from {
            return false;
        }
        status.state = to;
        true
    }

    /// Records `error` as the terminal failure unless a terminal state was
    /// already reached, then stops the remaining workers.
    fn fail(&self, error: &DownloadError) -> bool {
        let mut status = self.lock_status();
        if status.state.is_terminal() {
            debug!(key = self.key, error = %error, "ignoring failure after terminal state");
            return false;
        }
        status.state = SessionState::Error;
        status.error = Some(SessionError::from(error));
        drop(status);
        self.cancel.cancel();
        warn!(key = self.key, url = %self.url, error = %error, "download failed");
        true
    }

    fn finish(&self, total: u64) -> bool {
        let mut status = self.lock_status();
        if status.state != SessionState::Downloading {
            return false;
        }
        if self.tracker.total().is_none() {
            self.tracker.set_total(total);
        }
        status.state = SessionState::Finished;
        true
    }

    /// Drives the session to a terminal state. Runs on the handler's pool.
    #[instrument(skip(self, ctx), fields(key = self.key, url = %self.url))]
    pub(crate) async fn run(self: Arc<Self>, ctx: WorkContext) {
        if !self.advance(SessionState::Pending, SessionState::Probing) {
            return;
        }

        let probed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            probed = probe(&ctx.client, &self.url, ctx.response_timeout) => probed,
        };
        let probed = match probed {
            Ok(probed) => probed,
            Err(e) => {
                self.fail(&e);
                return;
            }
        };

        if let Some(total) = probed.total_size {
            self.tracker.set_total(total);
        }
        let ranges = self.planner.plan(probed.total_size, probed.accepts_ranges);
        self.tracker.install_chunks(&ranges);

        let sink = match FileSink::create(&self.path, probed.total_size).await {
            Ok(sink) => sink,
            Err(e) => {
                self.fail(&e);
                return;
            }
        };

        if !self.advance(SessionState::Probing, SessionState::Downloading) {
            return;
        }
        info!(
            total_size = ?probed.total_size,
            accepts_ranges = probed.accepts_ranges,
            chunks = ranges.len(),
            "download started"
        );

        let sampler_stop = self.cancel.child_token();
        let _sampler_guard = sampler_stop.clone().drop_guard();
        tokio::spawn(sample_rate(Arc::clone(&self.tracker), sampler_stop));

        let ranged = probed.accepts_ranges && probed.total_size.is_some();
        let mut body = probed.body;
        let mut workers = JoinSet::new();
        for range in ranges {
            let fetcher = self.fetcher(&ctx, &sink, range, ranged);
            let prefetched = body.take();
            workers.spawn(run_chunk(fetcher, Arc::clone(&ctx.permits), prefetched));
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(FetchOutcome::Completed { .. } | FetchOutcome::Cancelled)) => {}
                Ok(Err(e)) => {
                    self.fail(&e);
                }
                Err(e) => {
                    let source = std::io::Error::other(format!("chunk worker aborted: {e}"));
                    self.fail(&DownloadError::io(&self.path, source));
                }
            }
        }

        self.settle(&sink).await;
        self.tracker.reset_rate();
    }

    /// Verifies and flushes a transfer whose workers all returned.
    async fn settle(&self, sink: &FileSink) {
        if self.state() != SessionState::Downloading {
            return;
        }
        let downloaded = self.tracker.downloaded();
        let expected = self.tracker.total().unwrap_or(downloaded);
        if downloaded != expected {
            self.fail(&DownloadError::length_mismatch(&*self.url, expected, downloaded));
            return;
        }
        if let Err(e) = sink.sync().await {
            self.fail(&e);
            return;
        }
        match sink.allocated_len().await {
            Ok(on_disk) if on_disk == expected => {}
            Ok(on_disk) => {
                self.fail(&DownloadError::length_mismatch(&*self.url, expected, on_disk));
                return;
            }
            Err(e) => {
                self.fail(&e);
                return;
            }
        }
        if self.finish(expected) {
            info!(bytes = expected, path = %self.path.display(), "download complete");
        }
    }

    fn fetcher(
        &self,
        ctx: &WorkContext,
        sink: &FileSink,
        range: ChunkRange,
        ranged: bool,
    ) -> RangeFetcher {
        RangeFetcher {
            client: ctx.client.clone(),
            url: Arc::clone(&self.url),
            range,
            ranged,
            sink: sink.clone(),
            tracker: Arc::clone(&self.tracker),
            cancel: self.cancel.clone(),
            paused: self.paused.subscribe(),
            response_timeout: ctx.response_timeout,
            read_timeout: ctx.read_timeout,
        }
    }
}

/// One schedulable unit: wait for a pool permit, then fetch the chunk.
async fn run_chunk(
    fetcher: RangeFetcher,
    permits: Arc<Semaphore>,
    prefetched: Option<reqwest::Response>,
) -> Result<FetchOutcome, DownloadError> {
    let cancel = fetcher.cancel.clone();
    let tracker = Arc::clone(&fetcher.tracker);
    let index = fetcher.range.index;

    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Ok(FetchOutcome::Cancelled),
        },
    };

    tracker.set_chunk_state(index, ChunkState::Active);
    let result = fetcher.run(prefetched).await;
    match &result {
        Ok(FetchOutcome::Completed { .. }) => tracker.set_chunk_state(index, ChunkState::Done),
        Ok(FetchOutcome::Cancelled) => {}
        Err(e) => {
            debug!(chunk = index, error = %e, "chunk failed");
            tracker.set_chunk_state(index, ChunkState::Failed);
        }
    }
    result
}

async fn sample_rate(tracker: Arc<ProgressTracker>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(RATE_SAMPLE_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => tracker.sample_rate(),
        }
    }
}
