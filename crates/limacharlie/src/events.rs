//! Error observation for REST calls and the event feed.
//!
//! Failures that are not recovered locally are reported to an optional
//! [`ErrorObserver`] as an [`ErrorEvent`], in addition to (or, with
//! `throw_on_error = false`, instead of) being returned to the caller. Feed
//! errors are always recovered by reconnecting, so the observer is the only
//! place they show up.
//!
//! | Observer | Use case |
//! |----------|----------|
//! | [`LoggingObserver`] | `tracing` warnings |
//! | [`FnObserver`] | Quick closures |
//! | [`CompositeObserver`] | Fan out to several observers in order |

use crate::error::ApiError;
use tracing::warn;

/// A failure reported to an [`ErrorObserver`].
#[derive(Debug, Clone, Copy)]
pub enum ErrorEvent<'a> {
    /// A REST call failed and will not be retried.
    Request { path: &'a str, error: &'a ApiError },
    /// Exchanging the API key (or running the renewal hook) failed.
    Authentication { error: &'a ApiError },
    /// The event feed broke. A reconnect is already underway.
    Feed { error: &'a ApiError },
}

impl<'a> ErrorEvent<'a> {
    /// The underlying error, whatever its origin.
    pub fn error(&self) -> &'a ApiError {
        match self {
            ErrorEvent::Request { error, .. }
            | ErrorEvent::Authentication { error }
            | ErrorEvent::Feed { error } => error,
        }
    }
}

/// Receives failures the client did not recover from.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, event: &ErrorEvent<'_>);
}

/// Logs every failure at `warn`.
pub struct LoggingObserver;

impl ErrorObserver for LoggingObserver {
    fn on_error(&self, event: &ErrorEvent<'_>) {
        match event {
            ErrorEvent::Request { path, error } => warn!("Request {path} failed: {error}"),
            ErrorEvent::Authentication { error } => warn!("Authentication failed: {error}"),
            ErrorEvent::Feed { error } => warn!("Event feed error: {error}"),
        }
    }
}

/// An observer backed by a closure.
pub struct FnObserver<F>(F)
where
    F: Fn(&ErrorEvent<'_>) + Send + Sync;

impl<F> FnObserver<F>
where
    F: Fn(&ErrorEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ErrorObserver for FnObserver<F>
where
    F: Fn(&ErrorEvent<'_>) + Send + Sync,
{
    fn on_error(&self, event: &ErrorEvent<'_>) {
        (self.0)(event)
    }
}

/// Forwards each failure to every inner observer, in registration order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Box<dyn ErrorObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl ErrorObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl ErrorObserver for CompositeObserver {
    fn on_error(&self, event: &ErrorEvent<'_>) {
        for observer in &self.observers {
            observer.on_error(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_fans_out_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let observer = CompositeObserver::new()
            .with(FnObserver::new(move |_| a.lock().unwrap().push("a")))
            .with(LoggingObserver)
            .with(FnObserver::new(move |_| b.lock().unwrap().push("b")));

        let err = ApiError::TransientTransport("reset".into());
        observer.on_error(&ErrorEvent::Feed { error: &err });

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn error_accessor_returns_inner_error() {
        let err = ApiError::Configuration("no key".into());
        let event = ErrorEvent::Request {
            path: "sensors/ORG1",
            error: &err,
        };
        assert_eq!(event.error(), &err);
    }
}
