//! Event feed against a mock stream endpoint: trace accounting, correlated
//! dispatch, reconnects, sweeping and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use limacharlie::api::streaming::{ConnectionFilter, Feed, FeedStatus};
use limacharlie::config::FeedConfig;
use limacharlie::credentials::Credentials;
use limacharlie::ApiError;
use limacharlie::events::{ErrorEvent, FnObserver};
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn feed_config(server: &MockServer) -> FeedConfig {
    FeedConfig::default()
        .with_stream_root(server.uri())
        .with_reconnect_backoff(Duration::from_millis(50))
}

fn ndjson(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Poll `cond` until it holds or five seconds pass.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

async fn mount_stream_once(server: &MockServer, body: String, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body).set_delay(delay))
        .up_to_n_times(1)
        .mount(server)
        .await;
    // Later reconnects are refused.
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(server)
        .await;
}

#[tokio::test]
async fn trace_messages_are_accounted() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"__trace": "dropped", "n": 5}),
        json!({"__trace": "dropped", "n": 3}),
        json!({"__trace": "connected"}),
    ]);
    mount_stream_once(&server, body, Duration::ZERO).await;

    let general = Arc::new(AtomicUsize::new(0));
    let g = general.clone();
    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server))
        .handler(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        })
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    assert!(eventually(|| feed.has_connected() && feed.dropped_count() == 8).await);
    // Control messages never reach the general handler.
    assert_eq!(general.load(Ordering::SeqCst), 0);
    feed.shutdown();
}

#[tokio::test]
async fn handshake_carries_filter_and_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .and(body_string_contains("type=detect"))
        .and(body_string_contains("api_key=key"))
        .and(body_string_contains("inv_id=inv-1"))
        .and(body_string_contains("tag=vip"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            json!({"__trace": "connected"}).to_string(),
        ))
        .mount(&server)
        .await;

    let filter = ConnectionFilter::new("detect").investigation("inv-1").tag("vip");
    let feed = Feed::builder(filter)
        .config(feed_config(&server))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    assert!(eventually(|| feed.has_connected()).await);
    feed.shutdown();
}

#[tokio::test]
async fn correlated_event_is_delivered_once_then_falls_through() {
    let server = MockServer::start().await;
    let tracked = json!({"routing": {"investigation_id": "inv/T1"}, "event": {"n": 1}});
    let body = ndjson(&[
        json!({"__trace": "connected"}),
        tracked.clone(),
        tracked.clone(),
        json!({"routing": {"sid": "s1"}, "event": {"n": 2}}),
    ]);
    // Delay the body so the registration below lands first.
    mount_stream_once(&server, body, Duration::from_millis(300)).await;

    let general = Arc::new(Mutex::new(Vec::new()));
    let sink = general.clone();
    let feed = Feed::builder(ConnectionFilter::new("event").investigation("inv"))
        .config(feed_config(&server))
        .handler(move |event| sink.lock().unwrap().push(event))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    let specific = Arc::new(Mutex::new(Vec::new()));
    let s = specific.clone();
    feed.register_specific_callback("inv/T1", Duration::from_secs(60), move |event| {
        s.lock().unwrap().push(event);
    });

    assert!(eventually(|| general.lock().unwrap().len() == 2).await);
    assert_eq!(*specific.lock().unwrap(), vec![tracked.clone()]);
    assert_eq!(general.lock().unwrap()[0], tracked);
    assert!(feed.registry().is_empty());
    feed.shutdown();
}

#[tokio::test]
async fn broken_stream_reconnects_and_reports() {
    let server = MockServer::start().await;
    mount_stream_once(
        &server,
        json!({"__trace": "connected"}).to_string(),
        Duration::ZERO,
    )
    .await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let observer = FnObserver::new(move |event: &ErrorEvent<'_>| {
        if let ErrorEvent::Feed { error } = event {
            sink.lock().unwrap().push((*error).clone());
        }
    });
    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server))
        .observer(Arc::new(observer))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    // End of body, then at least one refused reconnect.
    assert!(eventually(|| errors.lock().unwrap().len() >= 2).await);
    let errors = errors.lock().unwrap().clone();
    assert!(errors[0].is_retryable());
    assert_eq!(errors[1].status(), Some(503));
    feed.shutdown();
}

#[tokio::test]
async fn shutdown_is_idempotent_and_stops_reconnecting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    feed.shutdown();
    feed.shutdown();
    assert_eq!(feed.status(), FeedStatus::Shutdown);

    // Let any request already on the wire land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = server.received_requests().await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = server.received_requests().await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn shutdown_before_connecting_is_safe() {
    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(FeedConfig::default().with_stream_root("http://127.0.0.1:1"))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();
    feed.shutdown();
    assert!(!feed.has_connected());
    assert_eq!(feed.dropped_count(), 0);
    drop(feed);
}

#[tokio::test]
async fn first_reconnect_is_immediate_then_backoff_spaces_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server).with_reconnect_backoff(Duration::from_millis(400)))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    // Attempts at roughly 0, 0, 400 and 800 ms.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
    feed.shutdown();
}

#[tokio::test]
async fn sweep_purges_lapsed_registrations_while_running() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ORG1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server).with_sweep_interval(Duration::from_millis(100)))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    feed.register_specific_callback("inv/T1", Duration::from_millis(50), move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(feed.registry().len(), 1);

    // No event ever arrives, so only the sweep can remove it.
    assert!(eventually(|| feed.registry().is_empty()).await);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    feed.shutdown();
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_feed() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"__trace": "connected"}),
        json!({"event": {"n": 1}}),
        json!({"event": {"n": 2}}),
    ]);
    mount_stream_once(&server, body, Duration::ZERO).await;

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let reported = errors.clone();
    let observer = FnObserver::new(move |event: &ErrorEvent<'_>| {
        reported.lock().unwrap().push(event.error().clone());
    });
    let feed = Feed::builder(ConnectionFilter::new("event"))
        .config(feed_config(&server))
        .handler(move |event| {
            if event["event"]["n"] == 1 {
                panic!("cannot handle n=1");
            }
            sink.lock().unwrap().push(event);
        })
        .observer(Arc::new(observer))
        .start(Arc::new(Credentials::with_api_key("ORG1", "key")))
        .unwrap();

    assert!(eventually(|| delivered.lock().unwrap().len() == 1).await);
    assert_eq!(delivered.lock().unwrap()[0], json!({"event": {"n": 2}}));
    assert!(eventually(|| !errors.lock().unwrap().is_empty()).await);
    assert_eq!(
        errors.lock().unwrap()[0],
        ApiError::HandlerPanicked("cannot handle n=1".to_string())
    );
    feed.shutdown();
}
