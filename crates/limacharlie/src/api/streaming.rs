//! The event feed: one long-lived push connection, demultiplexed.
//!
//! [`Feed`] POSTs a [`ConnectionFilter`] plus the org credential to the
//! stream endpoint and reads the response body as an unbounded sequence of
//! JSON values. Every value is classified:
//!
//! - `{"__trace": "...dropped...", "n": N}` adds `N` to [`Feed::dropped_count`];
//! - `{"__trace": "connected"}` sets [`Feed::has_connected`];
//! - anything else is a domain event. If its `routing.investigation_id`
//!   matches a handler in the [`CallbackRegistry`], that handler consumes it;
//!   otherwise the general handler gets it; with neither, it is dropped (the
//!   feed is live and best-effort, nothing is buffered).
//!
//! When the body errors or ends, the feed reconnects from scratch with the
//! same filter and whatever credential is current at that moment. The first
//! reconnect is immediate; once a reconnect attempt itself fails, attempts
//! are spaced by [`FeedConfig::reconnect_backoff`]. The registry survives
//! reconnects untouched.
//!
//! Failures reach the [`ErrorObserver`] through a queue drained by its own
//! task, in order, so a slow observer never holds up a reconnect. A handler
//! that panics loses its event; the panic is reported as
//! [`ApiError::HandlerPanicked`] and the feed keeps reading.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::api::params::Params;
use crate::api::registry::{CallbackRegistry, SpecificCallback};
use crate::api::retry;
use crate::api::tracking::correlation_id;
use crate::config::FeedConfig;
use crate::credentials::Credentials;
use crate::error::{ApiError, Result};
use crate::events::{ErrorEvent, ErrorObserver};
use crate::{classify_transport, remote_message};

/// Handler for domain events nobody registered a specific callback for.
pub type GeneralHandler = Arc<dyn Fn(Value) + Send + Sync>;

// ── Filter ─────────────────────────────────────────────────────────

/// Which events the feed subscribes to. Fixed for the feed's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFilter {
    /// `event`, `detect`, `audit`, ...
    pub data_type: String,
    pub investigation_id: Option<String>,
    pub tag: Option<String>,
    pub category: Option<String>,
    pub sensor_id: Option<String>,
}

impl ConnectionFilter {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            investigation_id: None,
            tag: None,
            category: None,
            sensor_id: None,
        }
    }

    pub fn investigation(mut self, inv_id: impl Into<String>) -> Self {
        self.investigation_id = Some(inv_id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn category(mut self, cat: impl Into<String>) -> Self {
        self.category = Some(cat.into());
        self
    }

    pub fn sensor(mut self, sid: impl Into<String>) -> Self {
        self.sensor_id = Some(sid.into());
        self
    }

    /// Handshake form: the filter plus `api_key` (preferred) or `jwt`.
    pub fn form(&self, credentials: &Credentials) -> Result<Params> {
        let mut form = Params::new().with("type", &self.data_type);
        if let Some(key) = credentials.api_key() {
            form.push("api_key", key);
        } else if let Some(token) = credentials.token() {
            form.push("jwt", &*token);
        } else {
            return Err(ApiError::Configuration(
                "event feed needs an API key or a bearer token".to_string(),
            ));
        }
        Ok(form
            .with_opt("inv_id", self.investigation_id.as_deref())
            .with_opt("tag", self.tag.as_deref())
            .with_opt("cat", self.category.as_deref())
            .with_opt("sid", self.sensor_id.as_deref()))
    }
}

// ── State ──────────────────────────────────────────────────────────

/// Where the connection task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeedStatus {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Shutdown = 4,
}

impl FeedStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FeedStatus::Connecting,
            2 => FeedStatus::Connected,
            3 => FeedStatus::Reconnecting,
            4 => FeedStatus::Shutdown,
            _ => FeedStatus::Idle,
        }
    }
}

/// How one feed value was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Dropped(u64),
    Connected,
    Correlated,
    General,
    Discarded,
    Panicked,
}

/// State shared by the connection task, the sweep task and the handle.
struct FeedState {
    registry: CallbackRegistry,
    handler: Option<GeneralHandler>,
    reports: Option<mpsc::UnboundedSender<ApiError>>,
    dropped: AtomicU64,
    has_connected: AtomicBool,
    reconnecting: AtomicBool,
    shutting_down: AtomicBool,
    status: AtomicU8,
}

impl FeedState {
    fn new(
        handler: Option<GeneralHandler>,
        reports: Option<mpsc::UnboundedSender<ApiError>>,
    ) -> Self {
        Self {
            registry: CallbackRegistry::new(),
            handler,
            reports,
            dropped: AtomicU64::new(0),
            has_connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            status: AtomicU8::new(FeedStatus::Idle as u8),
        }
    }

    fn set_status(&self, status: FeedStatus) {
        // Shutdown is terminal.
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur != FeedStatus::Shutdown as u8).then_some(status as u8)
            });
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Classify and dispatch one value. Values are routed one at a time, in
    /// arrival order, by the connection task.
    fn route(&self, value: Value) -> Routed {
        if let Some(trace_marker) = value.get("__trace") {
            let marker = trace_marker.as_str().unwrap_or_default();
            if marker.contains("dropped") {
                let n = value.get("n").and_then(Value::as_u64).unwrap_or(0);
                let total = self.dropped.fetch_add(n, Ordering::SeqCst) + n;
                debug!("Feed reports {n} dropped event(s) ({total} total)");
                return Routed::Dropped(n);
            }
            if marker == "connected" {
                self.has_connected.store(true, Ordering::SeqCst);
                info!("Event feed confirmed connected");
                return Routed::Connected;
            }
            trace!("Ignoring trace message: {marker}");
            return Routed::Discarded;
        }

        let value = match correlation_id(&value).map(str::to_owned) {
            Some(id) => match self.registry.dispatch(&id, value) {
                Ok(()) => return Routed::Correlated,
                Err(unclaimed) => unclaimed,
            },
            None => value,
        };

        match &self.handler {
            Some(handler) => {
                handler(value);
                Routed::General
            }
            None => Routed::Discarded,
        }
    }

    /// [`route`](Self::route), with a panicking handler contained and
    /// reported instead of unwinding through the connection task.
    fn route_guarded(&self, value: Value) -> Routed {
        match panic::catch_unwind(AssertUnwindSafe(|| self.route(value))) {
            Ok(routed) => routed,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!("Event feed handler panicked: {message}");
                self.report(ApiError::HandlerPanicked(message));
                Routed::Panicked
            }
        }
    }

    /// Queue `error` for the observer, if there is one.
    fn report(&self, error: ApiError) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(error);
        }
    }

    /// Raise the reconnect guard. Returns `false` when a reconnect is already
    /// pending, in which case the signal is a duplicate and must be ignored.
    fn signal_failure(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// A new connection attempt is starting; lower the reconnect guard.
    fn begin_attempt(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Report a stream failure: kick off the reconnect, then queue it for
    /// the observer. Duplicate signals for the same failure are dropped.
    fn fail(&self, error: ApiError) {
        if !self.signal_failure() {
            debug!("Ignoring duplicate feed failure: {error}");
            return;
        }
        self.set_status(FeedStatus::Reconnecting);
        warn!("Event feed failed: {error}. Reconnecting");
        self.report(error);
    }
}

// ── Decoder ────────────────────────────────────────────────────────

/// Incremental parser for a body of concatenated / newline-delimited JSON.
///
/// Chunks can split a value anywhere; the incomplete tail is kept until the
/// next chunk completes it.
#[derive(Debug, Default)]
pub(crate) struct JsonStreamDecoder {
    buf: Vec<u8>,
}

impl JsonStreamDecoder {
    /// Append `chunk` and hand every complete value to `on_value`.
    ///
    /// Values completed before a syntax error are still delivered; the error
    /// is returned afterwards.
    pub(crate) fn feed(
        &mut self,
        chunk: &[u8],
        mut on_value: impl FnMut(Value),
    ) -> std::result::Result<(), serde_json::Error> {
        self.buf.extend_from_slice(chunk);
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        let outcome = loop {
            match stream.next() {
                Some(Ok(value)) => on_value(value),
                Some(Err(e)) if e.is_eof() => break Ok(()),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        let consumed = stream.byte_offset();
        self.buf.drain(..consumed);
        outcome
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

// ── Feed ───────────────────────────────────────────────────────────

/// Builder for [`Feed`].
pub struct FeedBuilder {
    filter: ConnectionFilter,
    config: FeedConfig,
    handler: Option<GeneralHandler>,
    observer: Option<Arc<dyn ErrorObserver>>,
}

impl FeedBuilder {
    pub fn new(filter: ConnectionFilter) -> Self {
        Self {
            filter,
            config: FeedConfig::default(),
            handler: None,
            observer: None,
        }
    }

    pub fn config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }

    /// General handler for domain events without a specific callback.
    pub fn handler(mut self, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawn the connection, sweep and reporting tasks. Must be called from
    /// within a tokio runtime.
    ///
    /// A zero `sweep_interval` or `reconnect_backoff` is a configuration
    /// error.
    pub fn start(self, credentials: Arc<Credentials>) -> Result<Feed> {
        if self.config.sweep_interval.is_zero() {
            return Err(ApiError::Configuration(
                "feed sweep interval must be non-zero".to_string(),
            ));
        }
        if self.config.reconnect_backoff.is_zero() {
            return Err(ApiError::Configuration(
                "feed reconnect backoff must be non-zero".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("limacharlie-rs/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let reports = self.observer.map(|observer| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(report_loop(rx, observer));
            tx
        });
        let state = Arc::new(FeedState::new(self.handler, reports));
        let conn = Connection {
            http,
            url: self.config.stream_url(credentials.org_id()),
            filter: self.filter.clone(),
            credentials,
            backoff: self.config.reconnect_backoff,
            state: state.clone(),
        };

        let connection = tokio::spawn(conn.run());
        let sweep = tokio::spawn(sweep_loop(state.clone(), self.config.sweep_interval));

        Ok(Feed {
            state,
            filter: self.filter,
            callback_ttl: self.config.callback_ttl,
            tasks: Mutex::new(Some(FeedTasks { connection, sweep })),
        })
    }
}

struct FeedTasks {
    connection: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

/// Handle to a running event feed. Dropping it shuts the feed down.
pub struct Feed {
    state: Arc<FeedState>,
    filter: ConnectionFilter,
    callback_ttl: Duration,
    tasks: Mutex<Option<FeedTasks>>,
}

impl Feed {
    pub fn builder(filter: ConnectionFilter) -> FeedBuilder {
        FeedBuilder::new(filter)
    }

    /// Route the next event correlated with `tracking_id` to `handler`
    /// instead of the general handler. The registration lapses after `ttl`.
    pub fn register_specific_callback(
        &self,
        tracking_id: impl Into<String>,
        ttl: Duration,
        handler: impl FnOnce(Value) + Send + 'static,
    ) {
        let callback: SpecificCallback = Box::new(handler);
        self.state.registry.register(tracking_id, ttl, callback);
    }

    /// Default TTL for tracked requests.
    pub fn callback_ttl(&self) -> Duration {
        self.callback_ttl
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.state.registry
    }

    pub fn filter(&self) -> &ConnectionFilter {
        &self.filter
    }

    /// Events the service reported as dropped, across all connections.
    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Whether the service has confirmed a connection at least once.
    pub fn has_connected(&self) -> bool {
        self.state.has_connected.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus::from_u8(self.state.status.load(Ordering::SeqCst))
    }

    /// Stop the sweep, abort the connection and release it. Safe to call any
    /// number of times, connected or not.
    pub fn shutdown(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.state.set_status(FeedStatus::Shutdown);
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tasks) = tasks {
            tasks.sweep.abort();
            tasks.connection.abort();
            info!("Event feed shut down");
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("filter", &self.filter)
            .field("status", &self.status())
            .field("dropped", &self.dropped_count())
            .field("pending_callbacks", &self.state.registry.len())
            .finish()
    }
}

// ── Connection task ────────────────────────────────────────────────

struct Connection {
    http: reqwest::Client,
    url: String,
    filter: ConnectionFilter,
    credentials: Arc<Credentials>,
    backoff: Duration,
    state: Arc<FeedState>,
}

impl Connection {
    async fn run(self) {
        // Failures since the last successful connect. The first reconnect
        // goes out immediately; later ones wait `backoff`.
        let mut failures: u32 = 0;
        loop {
            if self.state.is_shutting_down() {
                break;
            }
            if failures >= 2 {
                tokio::time::sleep(self.backoff).await;
            }

            self.state.begin_attempt();
            self.state.set_status(FeedStatus::Connecting);
            let response = match self.connect().await {
                Ok(resp) => resp,
                Err(error) => {
                    failures += 1;
                    self.state.fail(error);
                    continue;
                }
            };
            // A reconnect that raced with shutdown must not resume.
            if self.state.is_shutting_down() {
                break;
            }
            failures = 0;
            self.state.set_status(FeedStatus::Connected);
            debug!("Event feed stream open at {}", self.url);

            let error = self.consume(response).await;
            if self.state.is_shutting_down() {
                break;
            }
            failures += 1;
            self.state.fail(error);
        }
        debug!("Event feed connection task exiting");
    }

    async fn connect(&self) -> Result<reqwest::Response> {
        let form = self.filter.form(&self.credentials)?;
        debug!(
            "Opening event feed: type={}, inv_id={:?}",
            self.filter.data_type, self.filter.investigation_id
        );
        let resp = self
            .http
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(retry::classify_status(
                status.as_u16(),
                remote_message(&text, status),
            ));
        }
        Ok(resp)
    }

    /// Read the body until it fails or ends; returns why it stopped.
    async fn consume(&self, mut response: reqwest::Response) -> ApiError {
        let mut decoder = JsonStreamDecoder::default();
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    return ApiError::TransientTransport(
                        "event feed closed by remote".to_string(),
                    );
                }
                Err(e) => return classify_transport(&e),
            };
            let fed = decoder.feed(&chunk, |value| {
                self.state.route_guarded(value);
            });
            if let Err(e) = fed {
                return ApiError::MalformedResponse(format!("event feed: {e}"));
            }
            trace!("{} byte(s) of partial feed value buffered", decoder.pending_bytes());
        }
    }
}

/// Deliver queued failures to `observer` in order. Ends once the feed state,
/// and with it the sender, is gone.
async fn report_loop(mut rx: mpsc::UnboundedReceiver<ApiError>, observer: Arc<dyn ErrorObserver>) {
    while let Some(error) = rx.recv().await {
        observer.on_error(&ErrorEvent::Feed { error: &error });
    }
}

async fn sweep_loop(state: Arc<FeedState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.registry.sweep(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn collecting_state() -> (FeedState, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: GeneralHandler = Arc::new(move |v: Value| sink.lock().unwrap().push(v));
        (FeedState::new(Some(handler), None), seen)
    }

    #[test]
    fn trace_messages_update_counters_only() {
        let (state, seen) = collecting_state();
        assert_eq!(state.route(json!({"__trace": "dropped", "n": 5})), Routed::Dropped(5));
        assert_eq!(
            state.route(json!({"__trace": "events_dropped", "n": 3})),
            Routed::Dropped(3)
        );
        assert_eq!(state.route(json!({"__trace": "connected"})), Routed::Connected);

        assert_eq!(state.dropped.load(Ordering::SeqCst), 8);
        assert!(state.has_connected.load(Ordering::SeqCst));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn correlated_event_goes_to_specific_handler_once() {
        let (state, seen) = collecting_state();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        state.registry.register(
            "inv/T1",
            Duration::from_secs(60),
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let event = json!({"routing": {"investigation_id": "inv/T1"}, "event": {}});
        assert_eq!(state.route(event.clone()), Routed::Correlated);
        assert_eq!(state.route(event.clone()), Routed::General);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![event]);
    }

    #[test]
    fn uncorrelated_without_handler_is_discarded() {
        let state = FeedState::new(None, None);
        assert_eq!(state.route(json!({"event": {"x": 1}})), Routed::Discarded);
        assert_eq!(
            state.route(json!({"routing": {"investigation_id": "nobody"}})),
            Routed::Discarded
        );
    }

    #[test]
    fn expired_or_swept_correlation_falls_through_to_general() {
        let (state, seen) = collecting_state();
        let hits = Arc::new(AtomicUsize::new(0));
        let earlier = Instant::now() - Duration::from_secs(1);
        for id in ["inv/T1", "inv/T2"] {
            let h = hits.clone();
            state.registry.register_at(
                id,
                Duration::from_millis(1),
                Box::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
                earlier,
            );
        }

        // Both lapsed. T1 is still held when its event arrives; T2 is swept first.
        let late = json!({"routing": {"investigation_id": "inv/T1"}, "event": {}});
        assert_eq!(state.route(late.clone()), Routed::General);
        assert_eq!(state.registry.sweep(Instant::now()), 1);
        let swept = json!({"routing": {"investigation_id": "inv/T2"}, "event": {}});
        assert_eq!(state.route(swept.clone()), Routed::General);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), vec![late, swept]);
        assert!(state.registry.is_empty());
    }

    #[test]
    fn panicking_handler_is_contained_and_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: GeneralHandler = Arc::new(|v: Value| {
            if v["event"]["boom"] == true {
                panic!("handler blew up");
            }
        });
        let state = FeedState::new(Some(handler), Some(tx));

        assert_eq!(state.route_guarded(json!({"event": {"boom": true}})), Routed::Panicked);
        assert_eq!(state.route_guarded(json!({"event": {"boom": false}})), Routed::General);
        assert_eq!(
            rx.try_recv().unwrap(),
            ApiError::HandlerPanicked("handler blew up".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reconnect_guard_ignores_duplicate_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = FeedState::new(None, Some(tx));

        // Transport and parse errors for the same break.
        state.fail(ApiError::TransientTransport("reset".into()));
        state.fail(ApiError::MalformedResponse("truncated".into()));
        assert_eq!(rx.try_recv().unwrap(), ApiError::TransientTransport("reset".into()));
        assert!(rx.try_recv().is_err());

        // A new attempt re-arms the guard.
        state.begin_attempt();
        state.fail(ApiError::TransientTransport("refused".into()));
        assert_eq!(rx.try_recv().unwrap(), ApiError::TransientTransport("refused".into()));
    }

    #[test]
    fn zero_periods_are_rejected() {
        let credentials = Arc::new(Credentials::with_api_key("oid", "key"));
        let zero_sweep = Feed::builder(ConnectionFilter::new("event"))
            .config(FeedConfig::default().with_sweep_interval(Duration::ZERO))
            .start(credentials.clone());
        assert!(matches!(zero_sweep, Err(ApiError::Configuration(_))));

        let zero_backoff = Feed::builder(ConnectionFilter::new("event"))
            .config(FeedConfig::default().with_reconnect_backoff(Duration::ZERO))
            .start(credentials);
        assert!(matches!(zero_backoff, Err(ApiError::Configuration(_))));
    }

    #[tokio::test]
    async fn observer_receives_queued_failures_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Arc<dyn ErrorObserver> = Arc::new(FnObserver::new(move |event: &ErrorEvent<'_>| {
            sink.lock().unwrap().push(event.error().clone());
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report_loop(rx, observer));

        tx.send(ApiError::TransientTransport("reset".into())).unwrap();
        tx.send(ApiError::RemoteRejected { status: 503, message: "down".into() }).unwrap();
        drop(tx);
        reporter.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].status(), Some(503));
    }

    #[test]
    fn shutdown_status_is_terminal() {
        let state = FeedState::new(None, None);
        state.set_status(FeedStatus::Connected);
        state.set_status(FeedStatus::Shutdown);
        state.set_status(FeedStatus::Connecting);
        assert_eq!(
            FeedStatus::from_u8(state.status.load(Ordering::SeqCst)),
            FeedStatus::Shutdown
        );
    }

    #[test]
    fn decoder_reassembles_split_values() {
        let mut decoder = JsonStreamDecoder::default();
        let mut out = Vec::new();

        decoder
            .feed(br#"{"a":1}
{"b":"#, |v| out.push(v))
            .unwrap();
        assert_eq!(out, vec![json!({"a": 1})]);
        assert!(decoder.pending_bytes() > 0);

        decoder.feed(b"2}{\"c\":3}\n", |v| out.push(v)).unwrap();
        assert_eq!(out, vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
    }

    #[test]
    fn decoder_delivers_values_before_a_syntax_error() {
        let mut decoder = JsonStreamDecoder::default();
        let mut out = Vec::new();
        let result = decoder.feed(b"{\"ok\":true}\n}garbage", |v| out.push(v));
        assert!(result.is_err());
        assert_eq!(out, vec![json!({"ok": true})]);
    }

    #[test]
    fn filter_form_prefers_api_key() {
        let filter = ConnectionFilter::new("event")
            .investigation("inv")
            .tag("vip")
            .sensor("sid-1");

        let keyed = Credentials::with_api_key("oid", "key").and_token("jwt");
        let form = filter.form(&keyed).unwrap();
        assert_eq!(form.get("type"), Some("event"));
        assert_eq!(form.get("api_key"), Some("key"));
        assert_eq!(form.get("jwt"), None);
        assert_eq!(form.get("inv_id"), Some("inv"));
        assert_eq!(form.get("tag"), Some("vip"));
        assert_eq!(form.get("cat"), None);
        assert_eq!(form.get("sid"), Some("sid-1"));

        let token_only = Credentials::new("oid").and_token("jwt");
        assert_eq!(filter.form(&token_only).unwrap().get("jwt"), Some("jwt"));

        assert!(matches!(
            filter.form(&Credentials::new("oid")),
            Err(ApiError::Configuration(_))
        ));
    }
}
