//! HTTP API exercised through the router without a socket.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use opsrunner::api::{self, state::AppState};
use opsrunner::executor::{AnsibleLauncher, Executor, ExecutorConfig};
use opsrunner::runner::{ProcessRunner, RunnerConfig};
use opsrunner::scheduler::Scheduler;
use opsrunner::storage::{open_pool, ExecutionStore, StoreConfig};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

fn app(dir: &Path) -> Router {
    let pool = open_pool(dir.join("api.db").to_str().unwrap()).unwrap();
    let store = ExecutionStore::open(pool.clone(), StoreConfig::default()).unwrap();
    let executor = Executor::new(
        store,
        ProcessRunner::new(RunnerConfig::default()),
        Arc::new(AnsibleLauncher::new(dir)),
        ExecutorConfig::default(),
    );
    let scheduler = Scheduler::new(pool, executor.clone());
    api::router(AppState {
        executor,
        scheduler,
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn submit_and_wait(app: &Router, argv: &[&str]) -> (String, Value) {
    let (status, body) = call_json(
        app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "kind": "command", "argv": argv })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "running");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (status, body) = call_json(app, Method::GET, &format!("/api/v1/executions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["data"]["status"] != "running" {
            return (id, body["data"].clone());
        }
        assert!(Instant::now() < deadline, "execution never finished");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = call_json(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["data"]["version"].is_string());
}

#[tokio::test]
async fn test_submit_get_and_list_execution() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (id, record) = submit_and_wait(&app, &["echo", "api"]).await;
    assert_eq!(record["status"], "success");
    assert_eq!(record["output"], json!(["api"]));
    assert_eq!(record["kind"], "single_command");

    let (status, body) =
        call_json(&app, Method::GET, "/api/v1/executions?status=success&limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["id"], id.as_str());

    let (status, body) =
        call_json(&app, Method::GET, "/api/v1/executions?status=failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 0);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = call_json(&app, Method::GET, "/api/v1/executions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);

    let (status, _) = call_json(&app, Method::DELETE, "/api/v1/executions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call_json(
        &app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "kind": "command", "argv": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("argv"));
}

#[tokio::test]
async fn test_cancel_over_http() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = call_json(
        &app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "kind": "command", "argv": ["sleep", "30"] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let uri = format!("/api/v1/executions/{id}");
    let (status, body) = call_json(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, _) = call_json(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stream_replays_finished_execution() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (id, _) = submit_and_wait(&app, &["sh", "-c", "echo a; echo b"]).await;
    let (status, bytes) = call(&app, Method::GET, &format!("/api/v1/executions/{id}/stream"), None).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("event: line\ndata: a\n"));
    assert!(text.contains("event: line\ndata: b\n"));
    assert!(text.contains("event: completed\n"));
    assert!(text.find("data: a").unwrap() < text.find("event: completed").unwrap());
}

#[tokio::test]
async fn test_statistics_period() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());
    submit_and_wait(&app, &["true"]).await;
    submit_and_wait(&app, &["false"]).await;

    let (status, body) = call_json(&app, Method::GET, "/api/v1/statistics?period=week", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["period"], "week");
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["success"], 1);
    assert_eq!(body["data"]["failed"], 1);
    assert_eq!(body["data"]["success_rate"], 50.0);

    let (status, body) = call_json(&app, Method::GET, "/api/v1/statistics?period=year", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
}

#[tokio::test]
async fn test_malformed_input_gets_json_bad_request() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = call_json(
        &app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "kind": "bogus" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
    assert!(body["error"]["message"].is_string());

    let (status, body) = call_json(
        &app,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "name": "no-template", "cron_expr": "0 * * * *" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, body) = call_json(&app, Method::GET, "/api/v1/executions?limit=many", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, body) = call_json(&app, Method::GET, "/api/v1/no-such-route", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn test_dry_run_rejects_oversized_window() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = call_json(
        &app,
        Method::GET,
        "/api/v1/schedules/dry-run?hours=10000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, body) = call_json(&app, Method::GET, "/api/v1/schedules/dry-run?hours=-1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, _) = call_json(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_schedule_lifecycle() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());
    let template = json!({ "kind": "command", "argv": ["true"] });

    let (status, _) = call_json(
        &app,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "name": "bad", "cron_expr": "invalid", "template": template })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call_json(
        &app,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "name": "nightly", "cron_expr": "0 2 * * *", "template": template })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = call_json(&app, Method::GET, "/api/v1/schedules", None).await;
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["name"], "nightly");

    let (status, body) = call_json(&app, Method::GET, "/api/v1/schedules/dry-run?hours=48", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["upcoming"].as_array().unwrap().len() >= 1);

    let uri = format!("/api/v1/schedules/{id}");
    let (status, _) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
