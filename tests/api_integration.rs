//! API integration tests
//!
//! Drives the real HTTP surface over a loopback listener: ingestion,
//! query clamping, pipeline trigger, pattern listing, and the chat token
//! stream with its terminal `done` frame.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracery::api::{ApiServer, AppState};
use tracery::config::TraceryConfig;
use tracery::services::FallbackProvider;
use tracery::storage::LibsqlStorage;

async fn create_test_state(config: &TraceryConfig) -> (AppState, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let storage = Arc::new(
        LibsqlStorage::open(db_path.to_str().unwrap())
            .await
            .expect("failed to create test storage"),
    );

    let state = AppState::assemble(storage, config, Arc::new(FallbackProvider::instant()))
        .unwrap();

    (state, temp_dir)
}

/// Serve the router on an ephemeral loopback port
async fn spawn_server(state: AppState) -> SocketAddr {
    let router = ApiServer::build_router(state, Duration::from_secs(30));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

#[tokio::test]
async fn test_event_ingestion_end_to_end() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/events/log", addr))
        .json(&json!({
            "event_type": "chat",
            "source": "web",
            "user_id": "u1",
            "tags": ["a", "b"],
            "payload": {"msg": "hi"},
        }))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(true));
    assert!(body["id"].is_i64());
    assert!(body["created_at"].is_string());

    let body: Value = client
        .get(format!("http://{}/events/recent?limit=5", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["items"][0]["tags"], json!(["a", "b"]));
    assert_eq!(body["items"][0]["payload"]["msg"], json!("hi"));
}

#[tokio::test]
async fn test_validation_errors_are_structured() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/events/log", addr))
        .json(&json!({"event_type": "x"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("event_type"));
}

#[tokio::test]
async fn test_query_limit_is_clamped_not_rejected() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        client
            .post(format!("http://{}/events/log", addr))
            .json(&json!({"event_type": "chat"}))
            .send()
            .await
            .unwrap();
    }

    for limit in ["0", "10000"] {
        let response = client
            .get(format!("http://{}/events/recent?limit={}", addr, limit))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let body: Value = response.json().await.unwrap();
        let count = body["count"].as_u64().unwrap();
        assert!((1..=200).contains(&count), "count {} out of range", count);
    }
}

#[tokio::test]
async fn test_derive_and_pattern_listing() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;
    let client = reqwest::Client::new();

    for _ in 0..4 {
        client
            .post(format!("http://{}/events/log", addr))
            .json(&json!({"event_type": "ask_explain", "user_id": "u1"}))
            .send()
            .await
            .unwrap();
    }

    let body: Value = client
        .post(format!("http://{}/learning/derive", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["outcome"], json!("ran"));
    assert_eq!(body["events_processed"], json!(4));
    assert!(body["patterns_written"].as_u64().unwrap() >= 1);

    let body: Value = client
        .get(format!(
            "http://{}/learning/patterns?subject=u1&pattern_type=preference",
            addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["items"][0]["key"], json!("explain_level"));
    assert_eq!(body["items"][0]["value"], json!({"level": "high"}));

    let body: Value = client
        .get(format!("http://{}/learning/summary", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["summary"]["total"], json!(4));
    assert_eq!(
        body["summary"]["top_event_types"][0]["event_type"],
        json!("ask_explain")
    );
}

#[tokio::test]
async fn test_chat_stream_tokens_then_done() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/stream/chat?q=hello", addr))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // the server closes the stream after the terminal frame, so the whole
    // body is readable
    let body = response.text().await.unwrap();

    let first_token = body.find("\"type\":\"token\"").expect("no token frame");
    let done = body.find("\"type\":\"done\"").expect("no done frame");
    assert!(first_token < done, "done frame must come after tokens");
    assert!(body.contains("hello"));

    // no frames after the terminal one
    let tail = &body[done..];
    assert!(!tail.contains("\"type\":\"token\""));
}

#[tokio::test]
async fn test_chat_stream_requires_query() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;

    let response = reqwest::get(format!("http://{}/stream/chat?q=%20", addr))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn test_streaming_kill_switch_surfaces_terminal_error() {
    let mut config = TraceryConfig::default();
    config.features.streaming = false;

    let (state, _dir) = create_test_state(&config).await;
    let addr = spawn_server(state).await;

    let body = reqwest::get(format!("http://{}/stream/chat?q=hello", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    // a terminal error frame, then close; never a silent hang
    assert!(body.contains("\"type\":\"error\""));
    assert!(!body.contains("\"type\":\"token\""));
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _dir) = create_test_state(&TraceryConfig::default()).await;
    let addr = spawn_server(state).await;

    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], json!("ok"));
    assert!(body["version"].is_string());
}
