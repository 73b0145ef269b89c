//! HTTP routes, exercised over a real socket with `reqwest`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::*;
use mm_semantic_sync::broker::Broker;
use mm_semantic_sync::server;
use mm_semantic_sync::service::SyncService;
use mm_semantic_sync::sync_state::Flag;

struct TestServer {
    base: String,
    harness: Harness,
    shutdown: CancellationToken,
}

async fn start_server() -> TestServer {
    let upstream = ScriptedUpstream::new().with_channel(channel("c1", "O", 2), posts("c1", "a", 2));
    let harness = harness(upstream, 200, 15).await;
    let (broker, _dispatch) = Broker::spawn(16);
    let service = Arc::new(SyncService::new(harness.controller.clone(), broker, 16));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        server::serve(listener, service, token).await.ok();
    });

    TestServer {
        base,
        harness,
        shutdown,
    }
}

/// Read an SSE body until `needle` shows up.
async fn read_until(resp: &mut reqwest::Response, needle: &str) -> String {
    let mut body = String::new();
    timeout(Duration::from_secs(5), async {
        while !body.contains(needle) {
            match resp.chunk().await.unwrap() {
                Some(chunk) => body.push_str(&String::from_utf8_lossy(&chunk)),
                None => break,
            }
        }
    })
    .await
    .expect("timed out reading event stream");
    body
}

#[tokio::test]
async fn health_reports_version() {
    let srv = start_server().await;
    let body: Value = reqwest::get(format!("{}/health", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    srv.shutdown.cancel();
}

#[tokio::test]
async fn fetch_interval_can_be_read_and_changed() {
    let srv = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/sync/fetch_interval", srv.base);

    let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({"fetch_interval": 15}));

    let resp = client
        .put(&url)
        .json(&json!({"fetch_interval": 30}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["fetch_interval"], 30);

    let resp = client
        .put(&url)
        .json(&json!({"fetch_interval": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_interval");

    let resp = client
        .put(&url)
        .json(&json!({"fetch_interval": "soon"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    assert_eq!(srv.harness.state.fetch_interval().await.unwrap(), 30);
    srv.shutdown.cancel();
}

#[tokio::test]
async fn start_streams_progress_then_stop_streams_final_event() {
    let srv = start_server().await;
    let client = reqwest::Client::new();

    let mut start = client
        .get(format!("{}/sync/start", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 200);
    let body = read_until(&mut start, "onDone").await;
    assert!(body.contains("onProgress"));
    assert!(body.contains(r#""isDone":true"#));

    let flag: Value = client
        .get(format!("{}/sync/is_sync_in_progress", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(flag, json!({"is_sync_in_progress": true}));

    let mut stop = client
        .get(format!("{}/sync/stop", srv.base))
        .send()
        .await
        .unwrap();
    let body = read_until(&mut stop, "onStop").await;
    assert!(body.contains(r#""isStopped":true"#));

    let flag: Value = client
        .get(format!("{}/sync/is_fetch_in_progress", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(flag, json!({"is_fetch_in_progress": false}));
    assert!(!srv.harness.state.flag(Flag::Sync).await.unwrap());
    srv.shutdown.cancel();
}

#[tokio::test]
async fn start_conflicts_with_a_foreign_sync() {
    let srv = start_server().await;
    let lease = srv.harness.state.acquire(Flag::Sync).await.unwrap();

    let resp = reqwest::get(format!("{}/sync/start", srv.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "already_in_progress");

    lease.release().await;
    srv.shutdown.cancel();
}

#[tokio::test]
async fn status_includes_checkpoint_and_schedule() {
    let srv = start_server().await;
    let body: Value = reqwest::get(format!("{}/sync/status", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["fetch_interval"], 15);
    assert_eq!(body["total_fetched_posts"], 0);
    assert_eq!(body["is_sync_in_progress"], false);
    assert!(body["next_fetch_at"].is_null());
    assert!(body["last_fetched_at"].is_null());
    srv.shutdown.cancel();
}

#[tokio::test]
async fn status_stream_pushes_flag_changes() {
    let srv = start_server().await;
    let mut stream = reqwest::get(format!("{}/sync/status/stream", srv.base))
        .await
        .unwrap();
    let first = read_until(&mut stream, "is_sync_in_progress").await;
    assert!(first.contains(r#""is_sync_in_progress":false"#));

    let lease = srv.harness.state.acquire(Flag::Sync).await.unwrap();
    read_until(&mut stream, r#""is_sync_in_progress":true"#).await;
    lease.release().await;
    srv.shutdown.cancel();
}
