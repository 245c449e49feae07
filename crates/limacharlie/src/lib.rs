//! Async client for the LimaCharlie security-telemetry service.
//!
//! `limacharlie` wraps two channels to the service:
//!
//! - **REST calls** through [`Client::execute`]: bearer-token authentication
//!   with transparent renewal, and a bounded, classified retry policy
//!   ([`api::retry`]) for 401s, rate limits, quota rejections and transport
//!   failures.
//! - **The event feed** through [`Feed`](api::streaming::Feed): one
//!   long-lived push connection that reconnects on failure and routes each
//!   event either to a per-request handler registered under a tracking id
//!   ([`api::registry`]) or to a general handler.
//!
//! The [`Manager`](manager::Manager) and [`Sensor`](sensor::Sensor) façades
//! build the endpoint calls on top of both.
//!
//! # Getting started
//!
//! ```ignore
//! use limacharlie::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ApiError> {
//!     let manager = Manager::new(ManagerConfig::from_env()?)?;
//!
//!     for sensor in manager.sensors(None, false).await? {
//!         println!("{} {:?}", sensor.sid(), sensor.hostname().await?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Credentials and renewal hooks:** [`credentials`].
//! - **Retry table and tuning:** [`api::retry::RetryPolicy`] inside
//!   [`ClientConfig`](config::ClientConfig).
//! - **Event feed, tracked requests:** [`api::streaming`],
//!   [`api::registry`], [`api::tracking`].
//! - **Failure reporting:** [`events::ErrorObserver`].
//! - **Compressed payloads:** [`compression`].
//! - **Webhook signatures:** [`webhook`].

pub mod api;
pub mod compression;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod manager;
pub mod prelude;
pub mod resources;
pub mod sensor;
pub mod webhook;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::api::params::Params;
use crate::api::retry::{self, RetryAction, RetryState};
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::events::{ErrorEvent, ErrorObserver};

pub use crate::error::{ApiError, Result};
pub use reqwest::Method;

// ── Constants ──────────────────────────────────────────────────────

/// REST root for the public service.
pub const ROOT_URL: &str = "https://api.limacharlie.io";

/// REST API version segment.
pub const API_VERSION: &str = "v1";

/// Token exchange endpoint (`oid` + `secret` → `jwt`).
pub const JWT_URL: &str = "https://app.limacharlie.io/jwt";

/// Event feed root; the org id is appended.
pub const STREAM_ROOT: &str = "https://stream.limacharlie.io";

// ── Call options ───────────────────────────────────────────────────

/// Per-call knobs for [`Client::execute`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Skip the retry table entirely. Default: `false`.
    pub no_retry: bool,
    /// Return unrecoverable errors as `Err`. When `false` they are reported
    /// to the observer and the call returns `Ok(Value::Null)`. Default: `true`.
    pub throw_on_error: bool,
    /// Override the client-wide timeout for this call.
    pub timeout: Option<Duration>,
    /// Use this root instead of `<api_root>/<api_version>`.
    pub alt_root: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            no_retry: false,
            throw_on_error: true,
            timeout: None,
            alt_root: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// Swallow unrecoverable errors (observer only).
    pub fn quiet(mut self) -> Self {
        self.throw_on_error = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn alt_root(mut self, root: impl Into<String>) -> Self {
        self.alt_root = Some(root.into());
        self
    }
}

// ── Client ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    jwt: String,
}

/// Authenticated request executor.
///
/// Cheap to share behind an `Arc`; every call reads the current token from
/// the shared [`Credentials`], so a renewal made by one call is picked up by
/// all others and by the event feed's next reconnect.
pub struct Client {
    pub(crate) http: reqwest::Client,
    pub(crate) config: ClientConfig,
    pub(crate) credentials: Arc<Credentials>,
    observer: Option<Arc<dyn ErrorObserver>>,
}

impl Client {
    /// Create a client against the public service.
    pub fn new(credentials: Arc<Credentials>) -> Result<Self> {
        Self::with_config(credentials, ClientConfig::default())
    }

    pub fn with_config(credentials: Arc<Credentials>, config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("limacharlie-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            credentials,
            observer: None,
        })
    }

    /// Report unrecoverable failures to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn observer(&self) -> Option<&Arc<dyn ErrorObserver>> {
        self.observer.as_ref()
    }

    /// The underlying HTTP client, for unauthenticated side fetches such as
    /// signed download URLs.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `GET` with default options.
    pub async fn get(&self, path: &str, params: &Params) -> Result<Value> {
        self.execute(path, Method::GET, params, &CallOptions::default())
            .await
    }

    /// `POST` with default options.
    pub async fn post(&self, path: &str, params: &Params) -> Result<Value> {
        self.execute(path, Method::POST, params, &CallOptions::default())
            .await
    }

    /// `DELETE` with default options.
    pub async fn delete(&self, path: &str, params: &Params) -> Result<Value> {
        self.execute(path, Method::DELETE, params, &CallOptions::default())
            .await
    }

    /// Issue an authenticated call and decode its JSON body.
    ///
    /// Fetches a token first when none is held. Failures go through the
    /// [retry table](api::retry); whatever is left is reported to the
    /// observer and returned as `Err` (or as `Ok(Value::Null)` when
    /// `options.throw_on_error` is `false`).
    pub async fn execute(
        &self,
        path: &str,
        method: Method,
        params: &Params,
        options: &CallOptions,
    ) -> Result<Value> {
        if self.credentials.token().is_none() && !self.credentials.can_authenticate() {
            let error =
                ApiError::Configuration("no API key, renewal hook or token available".to_string());
            return self.surface(path, error, options);
        }

        let url = self.url_for(path, options.alt_root.as_deref());
        let mut state = RetryState::new(options.no_retry);
        // Why the last renewal failed, surfaced in place of the request when
        // no token could be obtained.
        let mut auth_failure = None;
        let mut renew = self.credentials.token().is_none();

        loop {
            if renew {
                auth_failure = self.renew().await.err();
                renew = false;
            }
            let attempt = match (self.credentials.token(), &auth_failure) {
                (Some(token), _) => self.send_once(&url, &method, params, &token, options).await,
                (None, Some(error)) => Err(error.clone()),
                (None, None) => Err(ApiError::Unauthorized("no bearer token held".to_string())),
            };

            let error = match attempt {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let action = self.config.retry.decide(&error, &state);
            state.record(&action);
            match action {
                RetryAction::Reauthenticate => {
                    warn!("{method} {path}: {error}. Re-authenticating before retry");
                    renew = true;
                }
                RetryAction::Backoff { delay, .. } => {
                    warn!("{method} {path}: {error}. Retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    renew = self.credentials.token().is_none();
                }
                RetryAction::Surface => return self.surface(path, error, options),
            }
        }
    }

    /// Renew the bearer token.
    ///
    /// Uses the renewal hook when one is configured, otherwise exchanges the
    /// API key at the token endpoint. On failure the held token is cleared
    /// (so the next call starts fresh), the error is reported to the
    /// observer, and `false` is returned.
    pub async fn refresh_token(&self) -> bool {
        self.renew().await.is_ok()
    }

    async fn renew(&self) -> Result<()> {
        let org_id = self.credentials.org_id();
        let renewed = match self.credentials.renewal() {
            Some(hook) => hook.renew(org_id).await,
            None => self.fetch_token().await,
        };
        match renewed {
            Ok(token) => {
                self.credentials.replace_token(Some(token));
                debug!("Bearer token renewed for org {org_id}");
                Ok(())
            }
            Err(error) => {
                self.credentials.replace_token(None);
                warn!("Failed to refresh the JWT: {error}");
                if let Some(observer) = &self.observer {
                    observer.on_error(&ErrorEvent::Authentication { error: &error });
                }
                Err(error)
            }
        }
    }

    /// Exchange the org id and API key for a bearer token.
    async fn fetch_token(&self) -> Result<String> {
        let api_key = self
            .credentials
            .api_key()
            .ok_or_else(|| ApiError::Configuration("API key not set".to_string()))?;

        let resp = self
            .http
            .get(&self.config.jwt_url)
            .query(&[("oid", self.credentials.org_id()), ("secret", api_key)])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(retry::classify_status(
                status.as_u16(),
                remote_message(&text, status),
            ));
        }
        let parsed: TokenResponse = serde_json::from_str(&text)?;
        Ok(parsed.jwt)
    }

    async fn send_once(
        &self,
        url: &str,
        method: &Method,
        params: &Params,
        token: &str,
        options: &CallOptions,
    ) -> Result<Value> {
        debug!("API request: {method} {url} ({} params)", params.len());

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, format!("bearer {token}"));
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        request = if *method == Method::GET {
            request.query(params)
        } else {
            request.form(params)
        };

        let start = Instant::now();
        let resp = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify_transport(&e))?;

        debug!(
            "API response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(retry::classify_status(
                status.as_u16(),
                remote_message(&text, status),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        trace!("Response body: {text}");
        Ok(serde_json::from_str(&text)?)
    }

    fn surface(&self, path: &str, error: ApiError, options: &CallOptions) -> Result<Value> {
        if let Some(observer) = &self.observer {
            observer.on_error(&ErrorEvent::Request {
                path,
                error: &error,
            });
        }
        if options.throw_on_error {
            Err(error)
        } else {
            info!("Swallowing error for {path}: {error}");
            Ok(Value::Null)
        }
    }

    fn url_for(&self, path: &str, alt_root: Option<&str>) -> String {
        let root = match alt_root {
            Some(root) => root.trim_end_matches('/').to_string(),
            None => self.config.versioned_root(),
        };
        format!("{root}/{}", path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// The server's error message: `{"error": "..."}` when present, otherwise
/// the raw body, otherwise the status line.
pub(crate) fn remote_message(body: &str, status: reqwest::StatusCode) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body)
        && let Some(Value::String(message)) = map.get("error")
    {
        return message.clone();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Map a transport-level `reqwest` failure to the error taxonomy.
pub(crate) fn classify_transport(e: &reqwest::Error) -> ApiError {
    let text = error_chain(e);
    if e.is_builder() {
        ApiError::Configuration(text)
    } else if e.is_decode() {
        ApiError::MalformedResponse(text)
    } else if e.is_connect() || e.is_timeout() || retry::is_transient_error(&text) {
        ApiError::TransientTransport(text)
    } else {
        ApiError::RemoteRejected {
            status: e.status().map_or(0, |s| s.as_u16()),
            message: text,
        }
    }
}

/// `reqwest`'s top-level message hides the cause; walk the source chain.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
