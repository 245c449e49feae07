//! Error taxonomy for REST calls and the event feed.
//!
//! Every failure the client can produce is an [`ApiError`]. The first four
//! variants are recovered locally by the request executor's retry table
//! (see [`api::retry`](crate::api::retry)); they only reach callers once the
//! call chain has spent its retries.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// Classified client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The remote rejected the bearer token (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote is throttling this org (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A 400 response whose message mentions a quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Connection-level failure (reset, refused, timed out, ...).
    #[error("transport error: {0}")]
    TransientTransport(String),

    /// Any other remote failure. `message` is the server-supplied error when
    /// the body carried one, otherwise the raw response text.
    #[error("remote rejected request (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// A response or stream payload could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// No usable credential, or an invalid client setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A feed event handler panicked. The event is lost; the feed carries on.
    #[error("event handler panicked: {0}")]
    HandlerPanicked(String),
}

impl ApiError {
    /// HTTP status associated with this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized(_) => Some(401),
            ApiError::RateLimited(_) => Some(429),
            ApiError::QuotaExceeded(_) => Some(400),
            ApiError::RemoteRejected { status, .. } => Some(*status),
            ApiError::TransientTransport(_)
            | ApiError::MalformedResponse(_)
            | ApiError::Configuration(_)
            | ApiError::HandlerPanicked(_) => None,
        }
    }

    /// Whether the executor's retry table has a policy for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized(_)
                | ApiError::RateLimited(_)
                | ApiError::QuotaExceeded(_)
                | ApiError::TransientTransport(_)
        )
    }

    /// The human-readable message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            ApiError::Unauthorized(m)
            | ApiError::RateLimited(m)
            | ApiError::QuotaExceeded(m)
            | ApiError::TransientTransport(m)
            | ApiError::MalformedResponse(m)
            | ApiError::Configuration(m)
            | ApiError::HandlerPanicked(m) => m,
            ApiError::RemoteRejected { message, .. } => message,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::MalformedResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_classification() {
        assert_eq!(ApiError::Unauthorized("x".into()).status(), Some(401));
        assert_eq!(ApiError::RateLimited("x".into()).status(), Some(429));
        assert_eq!(ApiError::QuotaExceeded("x".into()).status(), Some(400));
        assert_eq!(ApiError::TransientTransport("x".into()).status(), None);
        let rejected = ApiError::RemoteRejected {
            status: 404,
            message: "no such sensor".into(),
        };
        assert_eq!(rejected.status(), Some(404));
        assert_eq!(rejected.message(), "no such sensor");
    }

    #[test]
    fn only_recoverable_kinds_are_retryable() {
        assert!(ApiError::Unauthorized(String::new()).is_retryable());
        assert!(ApiError::TransientTransport(String::new()).is_retryable());
        assert!(!ApiError::Configuration(String::new()).is_retryable());
        assert!(!ApiError::MalformedResponse(String::new()).is_retryable());
    }

    #[test]
    fn json_errors_become_malformed_response() {
        let err: ApiError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }
}
