//! Error types for the download module.
//!
//! Every failure carries the context (url, path, key) needed to turn it into
//! a session's terminal error message. [`ErrorKind`] groups the variants into
//! the small taxonomy exposed at the handler boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while starting, running, or querying a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Caller supplied a malformed url, path, task count, or block size.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Human-readable description of the rejected value.
        reason: String,
    },

    /// The preliminary request could not establish size or range support.
    #[error("probe failed for {url}: {source}")]
    ProbeFailed {
        /// The probed URL.
        url: String,
        /// The failure that aborted the probe.
        #[source]
        source: Box<DownloadError>,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// No response or no body data arrived within the configured timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered with a status the request cannot accept.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The body of a range ended before (or ran past) the requested length.
    #[error("length mismatch downloading {url}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// The URL being fetched.
        url: String,
        /// Bytes the range should contain.
        expected: u64,
        /// Bytes the server actually delivered.
        actual: u64,
    },

    /// A `206` reply covered a different range than the one requested.
    #[error("range mismatch downloading {url}: requested offset {requested}, server sent {received}")]
    RangeMismatch {
        /// The URL being fetched.
        url: String,
        /// First byte the request asked for.
        requested: u64,
        /// First byte named by the reply's `Content-Range`.
        received: u64,
    },

    /// File system error while allocating or writing the destination.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The handler's worker pool could not be started.
    #[error("failed to start worker pool: {source}")]
    Pool {
        /// The underlying runtime builder error.
        #[source]
        source: std::io::Error,
    },

    /// Query or mutation against a key the handler does not own.
    #[error("unknown download key {key}")]
    UnknownKey {
        /// The key that was looked up.
        key: u64,
    },
}

/// Boundary-level classification of a [`DownloadError`].
///
/// `InvalidInput` and `UnknownKey` are reported synchronously by handler
/// calls. The others only ever surface through a session's `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad url, path, task count, or block size.
    InvalidInput,
    /// Size or range support could not be determined.
    ProbeFailed,
    /// Connection drop, timeout, TLS failure, short or long body.
    Network,
    /// Response status other than 2xx / 206 where required.
    HttpStatus,
    /// Disk allocation or write failure.
    Io,
    /// Query against a nonexistent session.
    UnknownKey,
}

impl ErrorKind {
    /// Stable numeric code; `0` is reserved for "no error".
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidInput => 1,
            Self::ProbeFailed => 2,
            Self::Network => 3,
            Self::HttpStatus => 4,
            Self::Io => 5,
            Self::UnknownKey => 6,
        }
    }
}

impl DownloadError {
    /// Creates an invalid input error.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Wraps a failure that happened while probing `url`.
    pub fn probe_failed(url: impl Into<String>, source: DownloadError) -> Self {
        Self::ProbeFailed {
            url: url.into(),
            source: Box::new(source),
        }
    }

    /// Creates a network error from a reqwest error.
    ///
    /// Timeouts reported by reqwest are folded into [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::timeout(url);
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a body length mismatch error.
    pub fn length_mismatch(url: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::LengthMismatch {
            url: url.into(),
            expected,
            actual,
        }
    }

    /// Creates a range mismatch error.
    pub fn range_mismatch(url: impl Into<String>, requested: u64, received: u64) -> Self {
        Self::RangeMismatch {
            url: url.into(),
            requested,
            received,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a worker pool start-up error.
    #[must_use]
    pub fn pool(source: std::io::Error) -> Self {
        Self::Pool { source }
    }

    /// Creates an unknown key error.
    #[must_use]
    pub fn unknown_key(key: u64) -> Self {
        Self::UnknownKey { key }
    }

    /// Returns the boundary classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::ProbeFailed { .. } => ErrorKind::ProbeFailed,
            Self::Network { .. } | Self::Timeout { .. } | Self::LengthMismatch { .. } => {
                ErrorKind::Network
            }
            Self::HttpStatus { .. } | Self::RangeMismatch { .. } => ErrorKind::HttpStatus,
            Self::Io { .. } | Self::Pool { .. } => ErrorKind::Io,
            Self::UnknownKey { .. } => ErrorKind::UnknownKey,
        }
    }
}
