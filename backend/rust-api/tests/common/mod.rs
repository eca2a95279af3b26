#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use proctor_api::{config::Config, create_router, services::AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Router over the in-memory ledger and rate limiter.
pub fn create_test_app() -> Router {
    create_test_app_with(Config::in_memory())
}

pub fn create_test_app_with(config: Config) -> Router {
    init_tracing();
    create_router(Arc::new(AppState::in_memory(config)))
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        })
    };
    (status, json)
}

pub async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn start_attempt(app: &Router, user_id: &str) -> String {
    let (status, json) = send_json(
        app,
        "POST",
        "/api/attempts/start",
        json!({ "userId": user_id, "assessmentId": "assessment-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "start failed: {json}");
    json["attemptId"].as_str().unwrap().to_string()
}

pub async fn submit_attempt(app: &Router, attempt_id: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/attempts/{}/submit", attempt_id))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn log_event(app: &Router, attempt_id: &str, event_type: &str) -> (StatusCode, Value) {
    send_json(
        app,
        "POST",
        "/api/events/single",
        json!({ "eventType": event_type, "attemptId": attempt_id }),
    )
    .await
}

pub async fn violation_count(app: &Router, attempt_id: &str) -> u64 {
    let (status, json) = get(app, &format!("/api/attempts/{}", attempt_id)).await;
    assert_eq!(status, StatusCode::OK);
    json["attempt"]["violationCount"].as_u64().unwrap()
}
