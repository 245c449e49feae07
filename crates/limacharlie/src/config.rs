//! Client and feed configuration with service defaults.
//!
//! [`ClientConfig`] drives the request executor; [`FeedConfig`] drives the
//! streaming feed router. Both default to the public LimaCharlie endpoints
//! and the timings the service documents, and expose `with_*` builders for
//! the settings callers commonly change (tests point them at a mock server).

use std::time::Duration;

use crate::api::retry::RetryPolicy;
use crate::{API_VERSION, JWT_URL, ROOT_URL, STREAM_ROOT};

/// Request executor settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST root, without the version segment. Default: [`ROOT_URL`].
    pub api_root: String,
    /// Version segment appended to `api_root`. Default: [`API_VERSION`].
    pub api_version: String,
    /// Token exchange endpoint. Default: [`JWT_URL`].
    pub jwt_url: String,
    /// Default per-request timeout. Default: 120 s.
    pub timeout: Duration,
    /// Retry delays and ceilings.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_root: ROOT_URL.to_string(),
            api_version: API_VERSION.to_string(),
            jwt_url: JWT_URL.to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Point the REST calls at a different root.
    pub fn with_api_root(mut self, root: impl Into<String>) -> Self {
        self.api_root = root.into();
        self
    }

    pub fn with_jwt_url(mut self, url: impl Into<String>) -> Self {
        self.jwt_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `<api_root>/<api_version>` with no trailing slash.
    pub fn versioned_root(&self) -> String {
        format!(
            "{}/{}",
            self.api_root.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }
}

/// Streaming feed router settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Stream root; the org id is appended. Default: [`STREAM_ROOT`].
    pub stream_root: String,
    /// Wait between reconnect attempts after the first one fails. Default: 2 s.
    pub reconnect_backoff: Duration,
    /// Period of the expired-correlation sweep. Default: 30 s.
    pub sweep_interval: Duration,
    /// TTL for tracked requests. Default: 60 s.
    pub callback_ttl: Duration,
    /// Connect timeout for each stream attempt. The body itself has no
    /// deadline. Default: 30 s.
    pub connect_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stream_root: STREAM_ROOT.to_string(),
            reconnect_backoff: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(30),
            callback_ttl: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl FeedConfig {
    pub fn with_stream_root(mut self, root: impl Into<String>) -> Self {
        self.stream_root = root.into();
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_callback_ttl(mut self, ttl: Duration) -> Self {
        self.callback_ttl = ttl;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Full stream URL for `org_id`.
    pub fn stream_url(&self, org_id: &str) -> String {
        format!("{}/{org_id}", self.stream_root.trim_end_matches('/'))
    }
}
