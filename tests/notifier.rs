// Delivery of subscriber notifications to a local HTTP endpoint
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use conductor_rs::notify::{HttpNotifier, NOTIFY_CONCURRENCY, Notifier, SubscriberMessage};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn receive(State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>) -> &'static str {
    let _ = tx.send(body);
    "ok"
}

/// Serve one subscriber endpoint and return its URL.
async fn spawn_subscriber(tx: mpsc::UnboundedSender<Value>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/v1/conducts", post(receive)).with_state(tx);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/conducts", addr)
}

async fn next_body(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no notification received")
        .unwrap()
}

#[tokio::test]
async fn test_checkpoint_is_posted_as_json() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let url = spawn_subscriber(tx).await;

    let notifier = HttpNotifier::new(vec![url]);
    notifier.notify(SubscriberMessage::NotifyCheckpoint { bot: "1".to_string(), checkpoint: 7 });

    let body = next_body(&mut rx).await;
    assert_eq!(body, json!({ "command": "notifyCheckpoint", "bot": "1", "checkpoint": 7 }));
}

#[tokio::test]
async fn test_every_subscriber_receives_the_broadcast() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut urls = Vec::new();
    for _ in 0..7 {
        urls.push(spawn_subscriber(tx.clone()).await);
    }
    // One endpoint that refuses connections must not stop the others.
    urls.push("http://127.0.0.1:9/v1/conducts".to_string());

    let notifier = HttpNotifier::new(urls);
    notifier
        .broadcast(&SubscriberMessage::NotifyCheckpoint { bot: "2".to_string(), checkpoint: 3 })
        .await;

    for _ in 0..7 {
        let body = next_body(&mut rx).await;
        assert_eq!(body["checkpoint"], 3);
        assert_eq!(body["bot"], "2");
    }
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Accepts the request and never answers within the test.
async fn stall(State(in_flight): State<Arc<InFlight>>) -> &'static str {
    let now = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
    in_flight.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    in_flight.current.fetch_sub(1, Ordering::SeqCst);
    "ok"
}

#[tokio::test]
async fn test_notifications_share_one_concurrency_limit() {
    let in_flight = Arc::new(InFlight::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/v1/conducts", post(stall)).with_state(in_flight.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let notifier = HttpNotifier::new(vec![format!("http://{}/v1/conducts", addr)]);
    for checkpoint in 0..20 {
        notifier.notify(SubscriberMessage::NotifyCheckpoint { bot: "1".to_string(), checkpoint });
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while in_flight.peak.load(Ordering::SeqCst) < NOTIFY_CONCURRENCY {
        assert!(tokio::time::Instant::now() < deadline, "requests never reached the endpoint");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(in_flight.peak.load(Ordering::SeqCst), NOTIFY_CONCURRENCY);
}
