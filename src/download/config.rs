//! Handler configuration.
//!
//! A [`HandlerConfig`] can be built in code or loaded from a JSON document;
//! every field is optional in the document and falls back to the defaults in
//! [`super::constants`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_THREAD_COUNT, READ_TIMEOUT_SECS, RELEASE_TIMEOUT_SECS,
    RESPONSE_TIMEOUT_SECS,
};
use super::error::DownloadError;

/// Configuration shared by every session a handler spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Worker threads in the shared pool; `0` is clamped to `1`.
    pub thread_count: usize,
    /// TCP/TLS connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Time allowed for response headers to arrive, in seconds.
    pub response_timeout_secs: u64,
    /// Idle time allowed between two body reads, in seconds.
    pub read_timeout_secs: u64,
    /// Upper bound on the join performed when the handler is released.
    pub release_timeout_secs: u64,
    /// Overrides the default `User-Agent` header.
    pub user_agent: Option<String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            response_timeout_secs: RESPONSE_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            release_timeout_secs: RELEASE_TIMEOUT_SECS,
            user_agent: None,
        }
    }
}

impl HandlerConfig {
    /// Default configuration with the given pool size.
    #[must_use]
    pub fn with_thread_count(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidInput`] if the document is not valid
    /// JSON, has mistyped fields, or fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, DownloadError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DownloadError::invalid_input(format!("handler config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that cannot be clamped into something sensible.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidInput`] for zero timeouts or an empty
    /// user agent.
    pub fn validate(&self) -> Result<(), DownloadError> {
        for (name, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("response_timeout_secs", self.response_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if value == 0 {
                return Err(DownloadError::invalid_input(format!(
                    "`{name}` must be greater than zero"
                )));
            }
        }
        if self
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.trim().is_empty())
        {
            return Err(DownloadError::invalid_input("`user_agent` must not be empty"));
        }
        Ok(())
    }

    /// Pool size after clamping.
    #[must_use]
    pub fn effective_thread_count(&self) -> usize {
        self.thread_count.max(1)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub(crate) fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }
}
