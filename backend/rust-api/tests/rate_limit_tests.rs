use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use proctor_api::config::{Config, RateLimitConfig};
use std::time::Duration;

mod common;

fn limited_config(max_requests: u32, disabled: bool) -> Config {
    let mut config = Config::in_memory();
    config.events_rate_limit = RateLimitConfig {
        max_requests,
        window: Duration::from_secs(60),
        disabled,
    };
    config
}

fn events_request(ip: &str, attempt_id: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/api/events/attempt/{}", attempt_id))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_events_namespace_is_rate_limited_per_ip() {
    let app = common::create_test_app_with(limited_config(3, false));

    for _ in 0..3 {
        let (status, _) = common::send(&app, events_request("198.51.100.1", "a-1")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, json) = common::send(&app, events_request("198.51.100.1", "a-1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["success"], false);

    // a different caller keeps its own budget
    let (status, _) = common::send(&app, events_request("198.51.100.2", "a-1")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_attempt_routes_are_not_rate_limited() {
    let app = common::create_test_app_with(limited_config(1, false));

    for _ in 0..3 {
        let request = Request::builder()
            .method("GET")
            .uri("/api/attempts/user/student-1")
            .header("x-forwarded-for", "198.51.100.3")
            .body(Body::empty())
            .unwrap();
        let (status, _) = common::send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_rate_limit_can_be_disabled() {
    let app = common::create_test_app_with(limited_config(1, true));

    for _ in 0..5 {
        let (status, _) = common::send(&app, events_request("198.51.100.4", "a-1")).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_disable_flag_read_from_environment() {
    std::env::set_var("SKIP_ROOT_ENV", "1");
    std::env::set_var("RATE_LIMIT_DISABLED", "1");
    std::env::set_var("STORE_BACKEND", "memory");

    let config = Config::load().unwrap();

    std::env::remove_var("RATE_LIMIT_DISABLED");
    std::env::remove_var("STORE_BACKEND");
    std::env::remove_var("SKIP_ROOT_ENV");

    assert!(config.events_rate_limit.disabled);
    assert_eq!(config.store_backend, proctor_api::config::StoreBackend::Memory);
}
