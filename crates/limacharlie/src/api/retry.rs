//! Classified retry policy for REST calls.
//!
//! Each failure gets exactly one policy from a fixed table:
//!
//! | Error | Action | Consumes the one-shot retry |
//! |-------|--------|-----------------------------|
//! | 401 | re-authenticate, retry | yes |
//! | 429 | sleep `rate_limit_delay`, retry | no |
//! | 400 mentioning "quota" | sleep `quota_delay`, retry | no |
//! | connection-level failure | sleep `transient_delay`, retry | yes |
//! | anything else | surface | - |
//!
//! Once a call chain has spent its one-shot retry, every later failure is
//! surfaced. Throttle retries (429 and quota) do not spend it but are capped
//! by `max_throttle_retries`.

use std::time::Duration;

use crate::error::ApiError;

/// Delays and ceilings for the retry table.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep before retrying a 429.
    pub rate_limit_delay: Duration,
    /// Sleep before retrying a quota rejection.
    pub quota_delay: Duration,
    /// Sleep before retrying a connection-level failure.
    pub transient_delay: Duration,
    /// Upper bound on 429/quota retries within one call chain.
    pub max_throttle_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_delay: Duration::from_secs(10),
            quota_delay: Duration::from_secs(5),
            transient_delay: Duration::from_secs(1),
            max_throttle_retries: 30,
        }
    }
}

/// What the executor should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Renew the bearer token, then retry.
    Reauthenticate,
    /// Sleep, then retry.
    Backoff { delay: Duration, one_shot: bool },
    /// Give up and report the error.
    Surface,
}

/// Per-call-chain retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Set once the one-shot retry is spent (or by the caller up front).
    pub no_retry: bool,
    /// 429/quota retries taken so far.
    pub throttle_retries: u32,
}

impl RetryState {
    pub fn new(no_retry: bool) -> Self {
        Self {
            no_retry,
            throttle_retries: 0,
        }
    }

    /// Record that `action` is about to be taken.
    pub fn record(&mut self, action: &RetryAction) {
        match action {
            RetryAction::Reauthenticate => self.no_retry = true,
            RetryAction::Backoff { one_shot: true, .. } => self.no_retry = true,
            RetryAction::Backoff { one_shot: false, .. } => self.throttle_retries += 1,
            RetryAction::Surface => {}
        }
    }
}

impl RetryPolicy {
    /// Pick the action for `error` given the chain's state so far.
    pub fn decide(&self, error: &ApiError, state: &RetryState) -> RetryAction {
        if state.no_retry {
            return RetryAction::Surface;
        }
        let throttled = state.throttle_retries < self.max_throttle_retries;
        match error {
            ApiError::Unauthorized(_) => RetryAction::Reauthenticate,
            ApiError::RateLimited(_) if throttled => RetryAction::Backoff {
                delay: self.rate_limit_delay,
                one_shot: false,
            },
            ApiError::QuotaExceeded(_) if throttled => RetryAction::Backoff {
                delay: self.quota_delay,
                one_shot: false,
            },
            ApiError::TransientTransport(_) => RetryAction::Backoff {
                delay: self.transient_delay,
                one_shot: true,
            },
            _ => RetryAction::Surface,
        }
    }
}

/// Map a non-success HTTP status and its server message to an [`ApiError`].
pub fn classify_status(status: u16, message: String) -> ApiError {
    match status {
        401 => ApiError::Unauthorized(message),
        429 => ApiError::RateLimited(message),
        400 if is_quota_message(&message) => ApiError::QuotaExceeded(message),
        _ => ApiError::RemoteRejected { status, message },
    }
}

/// Whether a 400 message is a quota rejection.
pub fn is_quota_message(message: &str) -> bool {
    message.to_lowercase().contains("quota")
}

/// Whether an error string matches a generic network-failure signature.
pub fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    [
        "error sending request",
        "connection reset",
        "connection refused",
        "connection closed",
        "econnreset",
        "econnrefused",
        "etimedout",
        "socket hang up",
        "timed out",
        "broken pipe",
    ]
    .iter()
    .any(|p| lower.contains(p))
}
