//! Integration tests for all API endpoints.
//!
//! Each test boots the full Axum router (same assembly as `main.rs`) using
//! `tower::ServiceExt::oneshot`. No broker is needed: the pipeline publishes
//! into a `RecordingPublisher` and the store is in-memory SQLite.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use livestock_telemetry::{
    alerts::LogNotifier,
    api::{self, ApiState},
    db,
    metrics::AppMetrics,
    pipeline::{router::Topics, Pipeline, PipelineSettings},
    repository::TelemetryRepository,
    transport::RecordingPublisher,
};

// ---- Helpers ----------------------------------------------------------------

struct TestApp {
    app: Router,
    pipeline: Arc<Pipeline>,
    publisher: Arc<RecordingPublisher>,
}

async fn build_test_app() -> TestApp {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let repository = Arc::new(TelemetryRepository::new(pool));
    let publisher = Arc::new(RecordingPublisher::new());
    let metrics = Arc::new(AppMetrics::new().unwrap());

    let pipeline = Arc::new(Pipeline::new(
        repository,
        publisher.clone(),
        Arc::new(LogNotifier),
        Topics::default(),
        PipelineSettings::default(),
        Arc::clone(&metrics),
    ));

    let app = api::router(ApiState {
        pipeline: Arc::clone(&pipeline),
        metrics,
    });

    TestApp {
        app,
        pipeline,
        publisher,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, None).await
}

/// Wait for background persistence of dispatched messages.
async fn drain(pipeline: &Pipeline) {
    assert!(pipeline.shutdown(Duration::from_secs(5)).await);
}

// ---- GET /health ------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_with_ok_body() {
    let t = build_test_app().await;
    let resp = t
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn health_reports_unavailable_after_shutdown() {
    let t = build_test_app().await;
    drain(&t.pipeline).await;
    let (status, _) = get(&t.app, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ---- GET /metrics -----------------------------------------------------------

#[tokio::test]
async fn metrics_endpoint_is_prometheus_text() {
    let t = build_test_app().await;
    t.pipeline
        .dispatch("livestock/data", br#"{"level": 50, "status": "ok"}"#)
        .unwrap();

    let resp = t
        .app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/plain; version=0.0.4"
    );

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("livestock_telemetry_messages_received_total"));
}

// ---- Thresholds -------------------------------------------------------------

#[tokio::test]
async fn thresholds_missing_returns_404() {
    let t = build_test_app().await;
    let (status, json) = get(&t.app, "/devices/1/thresholds").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn thresholds_put_then_get() {
    let t = build_test_app().await;

    let (status, json) = send(
        &t.app,
        Method::PUT,
        "/devices/1/thresholds",
        Some(json!({ "upper_bound": 95.0, "lower_bound": 30.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["upper_bound"], 95.0);

    let (status, json) = get(&t.app, "/devices/1/thresholds").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["lower_bound"], 30.0);
    assert_eq!(json["device_id"], "1");

    assert_eq!(t.publisher.thresholds().len(), 1);
}

#[tokio::test]
async fn thresholds_inverted_bounds_return_400() {
    let t = build_test_app().await;
    let (status, json) = send(
        &t.app,
        Method::PUT,
        "/devices/1/thresholds",
        Some(json!({ "upper_bound": 20.0, "lower_bound": 80.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid bounds"));

    let (status, _) = get(&t.app, "/devices/1/thresholds").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---- Pump -------------------------------------------------------------------

#[tokio::test]
async fn pump_state_of_unknown_device_is_initial() {
    let t = build_test_app().await;
    let (status, json) = get(&t.app, "/devices/new-device/pump").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "off");
    assert_eq!(json["mode"], "auto");
}

#[tokio::test]
async fn pump_command_sets_state_and_publishes() {
    let t = build_test_app().await;

    let (status, json) = send(
        &t.app,
        Method::POST,
        "/devices/1/pump",
        Some(json!({ "mode": "manual", "status": "on" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "on");
    assert_eq!(json["mode"], "manual");

    let (_, json) = get(&t.app, "/devices/1/pump").await;
    assert_eq!(json["status"], "on");

    let commands = t.publisher.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].device_id, "1");
}

#[tokio::test]
async fn pump_command_with_bad_mode_is_rejected() {
    let t = build_test_app().await;
    let (status, _) = send(
        &t.app,
        Method::POST,
        "/devices/1/pump",
        Some(json!({ "mode": "turbo" })),
    )
    .await;
    assert!(status.is_client_error());
    assert!(t.publisher.commands().is_empty());
}

#[tokio::test]
async fn pump_history_lists_transitions_newest_first() {
    let t = build_test_app().await;
    for status in ["on", "off"] {
        send(
            &t.app,
            Method::POST,
            "/devices/1/pump",
            Some(json!({ "mode": "manual", "status": status })),
        )
        .await;
    }

    let (status, json) = get(&t.app, "/devices/1/pump/history?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let items = json["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["status"], "off");
    assert_eq!(items[0]["source"], "operator");
}

#[tokio::test]
async fn pump_command_after_shutdown_returns_503() {
    let t = build_test_app().await;
    drain(&t.pipeline).await;
    let (status, _) = send(
        &t.app,
        Method::POST,
        "/devices/1/pump",
        Some(json!({ "mode": "manual", "status": "on" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ---- Readings & usage -------------------------------------------------------

#[tokio::test]
async fn latest_reading_after_telemetry() {
    let t = build_test_app().await;
    t.pipeline
        .dispatch("livestock/data", br#"{"level": 42.5, "status": "normal", "volume": 2}"#)
        .unwrap();
    t.pipeline
        .dispatch("livestock/sensor/data", br#"{"temperature": 20, "humidity": 55}"#)
        .unwrap();
    drain(&t.pipeline).await;

    let (status, json) = get(&t.app, "/devices/1/readings/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["value"], 42.5);
    assert_eq!(json["kind"], "water_level");

    let (_, json) = get(&t.app, "/devices/1/readings/latest?kind=temperature").await;
    assert_eq!(json["status"], "low");

    let (status, json) = get(&t.app, "/devices/1/usage/today").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["usage_ml"], 2000.0);
}

#[tokio::test]
async fn latest_reading_unknown_kind_returns_400() {
    let t = build_test_app().await;
    let (status, _) = get(&t.app, "/devices/1/readings/latest?kind=pressure").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn latest_reading_none_returns_404() {
    let t = build_test_app().await;
    let (status, _) = get(&t.app, "/devices/1/readings/latest?kind=humidity").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn usage_today_defaults_to_zero() {
    let t = build_test_app().await;
    let (status, json) = get(&t.app, "/devices/7/usage/today").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["usage_ml"], 0.0);
}

#[tokio::test]
async fn usage_history_lists_recent_days_newest_first() {
    let t = build_test_app().await;
    let repo = t.pipeline.repository();
    let today = Utc::now().date_naive();
    repo.add_water_usage("1", today, 300.0).await.unwrap();
    repo.add_water_usage("1", today - ChronoDuration::days(3), 1200.0).await.unwrap();
    repo.add_water_usage("1", today - ChronoDuration::days(10), 800.0).await.unwrap();

    let (status, json) = get(&t.app, "/devices/1/usage/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["days"], 7);
    let items = json["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["date"], today.format("%Y-%m-%d").to_string());
    assert_eq!(items[0]["usage_ml"], 300.0);
    assert_eq!(items[1]["usage_ml"], 1200.0);

    let (_, json) = get(&t.app, "/devices/1/usage/history?days=30").await;
    assert_eq!(json["items"].as_array().unwrap().len(), 3);

    let (_, json) = get(&t.app, "/devices/1/usage/history?days=5000").await;
    assert_eq!(json["days"], 90);
    let (_, json) = get(&t.app, "/devices/1/usage/history?days=0").await;
    assert_eq!(json["days"], 1);
    assert_eq!(json["items"].as_array().unwrap().len(), 1);
}

// ---- GET /alerts/history ----------------------------------------------------

#[tokio::test]
async fn alert_history_returns_total_and_items() {
    let t = build_test_app().await;
    t.pipeline.thresholds().update("1", 95.0, 30.0).await.unwrap();
    t.pipeline
        .dispatch("livestock/data", br#"{"level": 10, "status": "low", "temperature": 40}"#)
        .unwrap();
    drain(&t.pipeline).await;

    let (status, json) = get(&t.app, "/alerts/history").await;
    assert_eq!(status, StatusCode::OK);
    // temp-high, level-low, pump-auto-on
    assert_eq!(json["total"], 3);
    assert_eq!(json["items"].as_array().unwrap().len(), 3);

    let (_, json) = get(&t.app, "/alerts/history?limit=1").await;
    assert_eq!(json["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn alert_history_clamps_limit() {
    let t = build_test_app().await;
    let (status, json) = get(&t.app, "/alerts/history?limit=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 0);
    assert!(json["items"].as_array().unwrap().is_empty());
}
