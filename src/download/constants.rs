//! Constants for the download module (timeouts, pool sizing).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default time allowed for response headers to arrive (15 seconds).
pub const RESPONSE_TIMEOUT_SECS: u64 = 15;

/// Default idle time allowed between two body reads (10 seconds).
pub const READ_TIMEOUT_SECS: u64 = 10;

/// Default bound on the join performed when a handler is released.
pub const RELEASE_TIMEOUT_SECS: u64 = 30;

/// Worker threads used when a handler is created without an explicit count.
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Interval between transfer-rate samples.
pub const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
