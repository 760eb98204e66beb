//! A wiremock server that serves a byte payload and honours `Range` headers.
//!
//! The handler under test owns its own runtime, so tests are plain `#[test]`
//! functions. The mock server gets a separate runtime held by [`TestServer`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use durl::{DownloadHandler, StateSnapshot};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::socket_guard::should_skip_socket_bound_test;

/// Deterministic, non-repeating-per-chunk test payload.
#[must_use]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect()
}

/// Serves `body`, answering `Range: bytes=a-b` with `206` and a
/// `Content-Range` header. Without a range header the full body is sent.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    delay: Option<Duration>,
}

impl RangeResponder {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            delay: None,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn template(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let Some((start, end)) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.to_vec());
        };

        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}").as_str());
        }
        let end = end.unwrap_or(total - 1).min(total - 1);
        let slice = &self.body[usize::try_from(start).unwrap_or(0)..=usize::try_from(end).unwrap_or(0)];
        ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {start}-{end}/{total}").as_str())
            .set_body_bytes(slice.to_vec())
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let template = self.template(request);
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Mock server plus the runtime it runs on.
pub struct TestServer {
    server: MockServer,
    runtime: tokio::runtime::Runtime,
}

impl TestServer {
    /// Starts a server, or returns `None` when localhost cannot be bound.
    #[track_caller]
    #[must_use]
    pub fn start_or_skip() -> Option<Self> {
        if should_skip_socket_bound_test() {
            return None;
        }
        init_tracing();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("mock server runtime");
        let server = runtime.block_on(MockServer::start());
        Some(Self { server, runtime })
    }

    /// Serves `body` with range support at `route`.
    pub fn serve_ranges(&self, route: &str, responder: RangeResponder) {
        self.mount(
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(responder),
        );
    }

    pub fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    #[must_use]
    pub fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    /// `Range` header of every request received so far (`None` for plain GETs).
    #[must_use]
    pub fn received_ranges(&self) -> Vec<Option<String>> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
            .iter()
            .map(|r| {
                r.headers
                    .get("range")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .collect()
    }
}

/// Routes engine logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls until the session reaches a terminal state.
///
/// # Panics
///
/// Panics if the session is still active after `timeout`.
#[track_caller]
pub fn wait_for_terminal(handler: &DownloadHandler, key: u64, timeout: Duration) -> StateSnapshot {
    let deadline = Instant::now() + timeout;
    loop {
        let state = handler.get_state(key).expect("registered key");
        if state.state.is_terminal() {
            return state;
        }
        assert!(
            Instant::now() < deadline,
            "download {key} still {:?} after {timeout:?}",
            state.state
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}
