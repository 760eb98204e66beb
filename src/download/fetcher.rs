//! Network side of a session: the size/range probe and per-chunk range fetches.
//!
//! A [`RangeFetcher`] owns one chunk for the duration of its task. It streams
//! the response body straight into the session's [`FileSink`] and credits the
//! [`ProgressTracker`] only after each block has been written.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::config::HandlerConfig;
use super::error::DownloadError;
use super::planner::ChunkRange;
use super::progress::ProgressTracker;
use super::sink::FileSink;
use crate::user_agent;

/// What the probe learned about the resource.
#[derive(Debug)]
pub(crate) struct ProbeOutcome {
    /// Resource size, if the server disclosed it.
    pub total_size: Option<u64>,
    /// Whether the server honours byte-range requests.
    pub accepts_ranges: bool,
    /// Full-body response kept from a server that ignored the probe's range,
    /// so the single chunk can consume it instead of requesting again.
    pub body: Option<Response>,
}

/// How a chunk worker ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOutcome {
    /// Every byte of the range was written.
    Completed {
        /// Bytes written by this worker.
        bytes: u64,
    },
    /// The session was cancelled before the range completed.
    Cancelled,
}

/// Builds the HTTP client shared by all sessions of a handler.
///
/// # Panics
///
/// Panics if the HTTP client builder fails to build (TLS backend
/// initialisation failure). This should never happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub(crate) fn build_client(config: &HandlerConfig) -> Client {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(user_agent::default_user_agent);
    Client::builder()
        .connect_timeout(config.connect_timeout())
        .user_agent(user_agent)
        .build()
        .expect("failed to build HTTP client with static configuration")
}

/// Issues `GET` with `Range: bytes=0-0` to learn size and range support.
///
/// # Errors
///
/// Every failure is wrapped in [`DownloadError::ProbeFailed`].
#[instrument(level = "debug", skip(client))]
pub(crate) async fn probe(
    client: &Client,
    url: &str,
    response_timeout: Duration,
) -> Result<ProbeOutcome, DownloadError> {
    let response = send_get(client, url, Some("bytes=0-0"), response_timeout)
        .await
        .map_err(|e| DownloadError::probe_failed(url, e))?;

    let status = response.status();
    let outcome = match status {
        StatusCode::PARTIAL_CONTENT => ProbeOutcome {
            total_size: content_range_total(response.headers()),
            accepts_ranges: true,
            body: None,
        },
        StatusCode::OK => ProbeOutcome {
            total_size: content_length(response.headers()),
            accepts_ranges: false,
            body: Some(response),
        },
        // An empty resource cannot satisfy `bytes=0-0`.
        StatusCode::RANGE_NOT_SATISFIABLE
            if content_range_total(response.headers()) == Some(0) =>
        {
            ProbeOutcome {
                total_size: Some(0),
                accepts_ranges: true,
                body: None,
            }
        }
        _ => {
            return Err(DownloadError::probe_failed(
                url,
                DownloadError::http_status(url, status.as_u16()),
            ));
        }
    };

    debug!(
        status = status.as_u16(),
        total_size = ?outcome.total_size,
        accepts_ranges = outcome.accepts_ranges,
        "probe complete"
    );
    Ok(outcome)
}

/// Fetches one chunk and writes it into the destination.
#[derive(Debug)]
pub(crate) struct RangeFetcher {
    pub(crate) client: Client,
    pub(crate) url: Arc<str>,
    pub(crate) range: ChunkRange,
    /// Send a `Range` header and require `206`.
    pub(crate) ranged: bool,
    pub(crate) sink: FileSink,
    pub(crate) tracker: Arc<ProgressTracker>,
    pub(crate) cancel: CancellationToken,
    pub(crate) paused: watch::Receiver<bool>,
    pub(crate) response_timeout: Duration,
    pub(crate) read_timeout: Duration,
}

impl RangeFetcher {
    /// Runs the fetch to completion, cancellation, or first failure.
    ///
    /// `prefetched` is a full-body `200` response left over from the probe.
    ///
    /// # Errors
    ///
    /// Returns the first connection, status, length, or write failure. The
    /// fetcher never retries.
    #[instrument(
        level = "debug",
        skip(self, prefetched),
        fields(chunk = self.range.index, start = self.range.start, end = ?self.range.end)
    )]
    pub(crate) async fn run(
        mut self,
        prefetched: Option<Response>,
    ) -> Result<FetchOutcome, DownloadError> {
        if !self.wait_while_paused().await {
            return Ok(FetchOutcome::Cancelled);
        }

        let response = match prefetched {
            Some(response) => response,
            None => {
                let range_header = if self.ranged {
                    self.range.range_header()
                } else {
                    None
                };
                let send = send_get(
                    &self.client,
                    &self.url,
                    range_header.as_deref(),
                    self.response_timeout,
                );
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                    response = send => response?,
                }
            }
        };

        self.check_status(&response)?;
        self.stream_into_sink(response).await
    }

    fn check_status(&self, response: &Response) -> Result<(), DownloadError> {
        let status = response.status();
        let accepted = if self.ranged {
            status == StatusCode::PARTIAL_CONTENT
        } else {
            status == StatusCode::OK
        };
        if !accepted {
            return Err(DownloadError::http_status(&*self.url, status.as_u16()));
        }
        if self.ranged
            && let Some(received) = content_range_start(response.headers())
            && received != self.range.start
        {
            warn!(requested = self.range.start, received, "server answered a different range");
            return Err(DownloadError::range_mismatch(
                &*self.url,
                self.range.start,
                received,
            ));
        }
        Ok(())
    }

    async fn stream_into_sink(&mut self, response: Response) -> Result<FetchOutcome, DownloadError> {
        let expected = self.range.len();
        let mut stream = response.bytes_stream();
        let mut offset = self.range.start;
        let mut written: u64 = 0;

        loop {
            if !self.wait_while_paused().await {
                return Ok(FetchOutcome::Cancelled);
            }

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                next = timeout(self.read_timeout, stream.next()) => next,
            };

            let block = match next {
                Err(_) => return Err(DownloadError::timeout(&*self.url)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(DownloadError::network(&*self.url, e)),
                Ok(Some(Ok(block))) => block,
            };
            if block.is_empty() {
                continue;
            }

            let len = block.len() as u64;
            if let Some(expected) = expected
                && written + len > expected
            {
                warn!(expected, received = written + len, "server sent more than the range");
                return Err(DownloadError::length_mismatch(
                    &*self.url,
                    expected,
                    written + len,
                ));
            }

            self.sink.write_at(offset, block).await?;
            offset += len;
            written += len;
            self.tracker.record(self.range.index, len);
            trace!(bytes = len, written, "block written");
        }

        if let Some(expected) = expected
            && written != expected
        {
            return Err(DownloadError::length_mismatch(
                &*self.url,
                expected,
                written,
            ));
        }

        debug!(bytes = written, "chunk complete");
        Ok(FetchOutcome::Completed { bytes: written })
    }

    /// Blocks while the session is suspended; `false` means cancelled.
    async fn wait_while_paused(&mut self) -> bool {
        while *self.paused.borrow_and_update() {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        !self.cancel.is_cancelled()
    }
}

async fn send_get(
    client: &Client,
    url: &str,
    range_header: Option<&str>,
    response_timeout: Duration,
) -> Result<Response, DownloadError> {
    let mut request = client.get(url).header(ACCEPT_ENCODING, "identity");
    if let Some(range) = range_header {
        request = request.header(RANGE, range);
    }
    match timeout(response_timeout, request.send()).await {
        Err(_) => Err(DownloadError::timeout(url)),
        Ok(Err(e)) => Err(DownloadError::network(url, e)),
        Ok(Ok(response)) => Ok(response),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Total size from `Content-Range: bytes <a>-<b>/<total>` (or `bytes */<total>`).
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

/// First byte from `Content-Range: bytes <a>-<b>/<total>`.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_start(value)
}

fn parse_content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, _) = rest.split_once('/')?;
    let (start, _) = span.split_once('-')?;
    start.trim().parse::<u64>().ok()
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    match total.trim() {
        "*" => None,
        total => total.parse::<u64>().ok(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn config() -> HandlerConfig {
        HandlerConfig::default()
    }

    fn fetcher_for(
        url: &str,
        range: ChunkRange,
        ranged: bool,
        sink: FileSink,
    ) -> (RangeFetcher, Arc<ProgressTracker>, watch::Sender<bool>) {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.install_chunks(&[range]);
        let (pause_tx, paused) = watch::channel(false);
        let fetcher = RangeFetcher {
            client: build_client(&config()),
            url: Arc::from(url),
            range,
            ranged,
            sink,
            tracker: Arc::clone(&tracker),
            cancel: CancellationToken::new(),
            paused,
            response_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        };
        (fetcher, tracker, pause_tx)
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes */0"), Some(0));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/10"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_parse_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(parse_content_range_start("bytes 0-0/*"), Some(0));
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start("garbage"), None);
    }

    #[tokio::test]
    async fn test_probe_detects_range_support() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/ranged.bin"))
            .and(header("Range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/5000")
                    .set_body_bytes(b"x".to_vec()),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/ranged.bin", mock_server.uri());
        let outcome = probe(&build_client(&config()), &url, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.total_size, Some(5000));
        assert!(outcome.accepts_ranges);
        assert!(outcome.body.is_none());
    }

    #[tokio::test]
    async fn test_probe_keeps_body_when_ranges_ignored() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/plain.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 300]))
            .mount(&mock_server)
            .await;

        let url = format!("{}/plain.bin", mock_server.uri());
        let outcome = probe(&build_client(&config()), &url, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.total_size, Some(300));
        assert!(!outcome.accepts_ranges);
        assert!(outcome.body.is_some());
    }

    #[tokio::test]
    async fn test_probe_error_status_is_probe_failed() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/missing.bin", mock_server.uri());
        let result = probe(&build_client(&config()), &url, Duration::from_secs(5)).await;

        match result {
            Err(DownloadError::ProbeFailed { source, .. }) => {
                assert!(matches!(*source, DownloadError::HttpStatus { status: 404, .. }));
            }
            other => panic!("Expected ProbeFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_writes_range_at_offset() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/part.bin"))
            .and(header("Range", "bytes=4-7"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"DATA".to_vec()))
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("part.bin");
        let sink = FileSink::create(&file_path, Some(8)).await.unwrap();
        let range = ChunkRange {
            index: 0,
            start: 4,
            end: Some(8),
        };
        let url = format!("{}/part.bin", mock_server.uri());
        let (fetcher, tracker, _pause) = fetcher_for(&url, range, true, sink);

        let outcome = fetcher.run(None).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 4 });
        assert_eq!(tracker.downloaded(), 4);
        assert_eq!(std::fs::read(&file_path).unwrap(), b"\0\0\0\0DATA");
    }

    #[tokio::test]
    async fn test_fetch_rejects_full_body_for_ranged_request() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/ignores-range.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let sink = FileSink::create(&temp_dir.path().join("f.bin"), Some(16))
            .await
            .unwrap();
        let range = ChunkRange {
            index: 0,
            start: 8,
            end: Some(16),
        };
        let url = format!("{}/ignores-range.bin", mock_server.uri());
        let (fetcher, tracker, _pause) = fetcher_for(&url, range, true, sink);

        let result = fetcher.run(None).await;

        assert!(matches!(result, Err(DownloadError::HttpStatus { status: 200, .. })));
        assert_eq!(tracker.downloaded(), 0);
    }

    #[tokio::test]
    async fn test_fetch_short_body_is_length_mismatch() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/short.bin"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"abc".to_vec()))
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let sink = FileSink::create(&temp_dir.path().join("s.bin"), Some(10))
            .await
            .unwrap();
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: Some(10),
        };
        let url = format!("{}/short.bin", mock_server.uri());
        let (fetcher, _tracker, _pause) = fetcher_for(&url, range, true, sink);

        let result = fetcher.run(None).await;

        match result {
            Err(DownloadError::LengthMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected LengthMismatch, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_long_body_is_length_mismatch() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/long.bin"))
            .and(header("Range", "bytes=0-99"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 150]))
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("l.bin");
        let sink = FileSink::create(&file_path, Some(100)).await.unwrap();
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: Some(100),
        };
        let url = format!("{}/long.bin", mock_server.uri());
        let (fetcher, tracker, _pause) = fetcher_for(&url, range, true, sink);

        let result = fetcher.run(None).await;

        match result {
            Err(DownloadError::LengthMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 100);
                assert!(actual > 100, "got {actual}");
            }
            other => panic!("Expected LengthMismatch, got: {other:?}"),
        }
        assert!(tracker.downloaded() <= 100);
        assert_eq!(std::fs::metadata(&file_path).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_fetch_rejects_reply_for_other_offset() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/shifted.bin"))
            .and(header("Range", "bytes=100-199"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-99/200")
                    .set_body_bytes(vec![1u8; 100]),
            )
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("shifted.bin");
        let sink = FileSink::create(&file_path, Some(200)).await.unwrap();
        let range = ChunkRange {
            index: 1,
            start: 100,
            end: Some(200),
        };
        let url = format!("{}/shifted.bin", mock_server.uri());
        let (fetcher, tracker, _pause) = fetcher_for(&url, range, true, sink);

        let result = fetcher.run(None).await;

        match result {
            Err(DownloadError::RangeMismatch {
                requested, received, ..
            }) => {
                assert_eq!(requested, 100);
                assert_eq!(received, 0);
            }
            other => panic!("Expected RangeMismatch, got: {other:?}"),
        }
        assert_eq!(tracker.downloaded(), 0);
        assert!(std::fs::read(&file_path).unwrap().iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_response() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let sink = FileSink::create(&temp_dir.path().join("c.bin"), Some(4))
            .await
            .unwrap();
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: Some(4),
        };
        let url = format!("{}/slow.bin", mock_server.uri());
        let (fetcher, tracker, _pause) = fetcher_for(&url, range, true, sink);
        let cancel = fetcher.cancel.clone();

        let task = tokio::spawn(fetcher.run(None));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, FetchOutcome::Cancelled);
        assert_eq!(tracker.downloaded(), 0);
    }
}
