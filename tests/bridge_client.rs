//! Retry behavior of the orchestrator-side client against a scripted server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::json;

use clawbridge::bridge::ReloadRequest;
use clawbridge::error::BridgeError;
use clawbridge::orchestrator::{BridgeClient, RetryPolicy};

/// Serves the statuses in `script` in order, then 200 forever.
#[derive(Clone)]
struct Script {
    statuses: Arc<Vec<u16>>,
    hits: Arc<AtomicUsize>,
}

impl Script {
    fn new(statuses: &[u16]) -> Self {
        Self {
            statuses: Arc::new(statuses.to_vec()),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn scripted(State(script): State<Script>) -> impl IntoResponse {
    let n = script.hits.fetch_add(1, Ordering::SeqCst);
    match script.statuses.get(n).copied() {
        Some(code) if code != 200 => {
            let status = StatusCode::from_u16(code).unwrap();
            (
                status,
                axum::Json(json!({"ok": false, "error": format!("scripted {code}")})),
            )
        }
        _ => (
            StatusCode::OK,
            axum::Json(json!({
                "ok": true,
                "data": {"reload": "restart", "profilesChanged": false, "version": "test"},
            })),
        ),
    }
}

async fn start_stub(script: Script) -> String {
    let app = Router::new()
        .route("/status", get(scripted))
        .route("/config/update", post(scripted))
        .route("/command", post(scripted))
        .route("/auth/login", post(scripted))
        .with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: vec![Duration::from_millis(50), Duration::from_millis(100)],
    }
}

#[tokio::test]
async fn test_retries_transient_failures_then_succeeds() {
    let script = Script::new(&[502, 502, 200]);
    let client = BridgeClient::new(start_stub(script.clone()).await).with_retry_policy(fast_retry());

    let started = Instant::now();
    let result = client
        .update_config(&json!({"gateway": {"port": 1}}), ReloadRequest::default())
        .await
        .unwrap();

    assert!(!result.profiles_changed);
    assert_eq!(script.hits(), 3);
    // Both backoff delays were waited.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let script = Script::new(&[503, 503, 503, 503]);
    let client = BridgeClient::new(start_stub(script.clone()).await).with_retry_policy(fast_retry());

    let err = client.status().await.unwrap_err();
    assert!(matches!(err, BridgeError::Rejected { status: 503, .. }));
    assert_eq!(script.hits(), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let script = Script::new(&[400, 200]);
    let client = BridgeClient::new(start_stub(script.clone()).await).with_retry_policy(fast_retry());

    let err = client
        .update_config(&json!({}), ReloadRequest::none())
        .await
        .unwrap_err();
    match err {
        BridgeError::Rejected { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("scripted 400"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(script.hits(), 1);
}

#[tokio::test]
async fn test_command_and_login_are_sent_once() {
    let script = Script::new(&[502, 502, 502]);
    let client = BridgeClient::new(start_stub(script.clone()).await).with_retry_policy(fast_retry());

    assert!(client.command(&["doctor".to_string()]).await.is_err());
    assert_eq!(script.hits(), 1);

    assert!(client.start_login("openai-codex").await.is_err());
    assert_eq!(script.hits(), 2);
}

#[tokio::test]
async fn test_wait_for_bridge_polls_until_ready() {
    let script = Script::new(&[503, 503]);
    let client = BridgeClient::new(start_stub(script.clone()).await);

    let ready = client
        .wait_for_bridge(Duration::from_millis(20), Duration::from_secs(5))
        .await;
    assert!(ready);
    assert_eq!(script.hits(), 3);
}

#[tokio::test]
async fn test_wait_for_bridge_stops_at_ceiling() {
    let script = Script::new(&[503; 1000]);
    let client = BridgeClient::new(start_stub(script.clone()).await);

    let started = Instant::now();
    let ready = client
        .wait_for_bridge(Duration::from_millis(20), Duration::from_millis(200))
        .await;
    assert!(!ready);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(script.hits() >= 2);
}
