use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BasicCredentials;
use crate::error::LedgerError;
use crate::metrics;
use crate::services::AppState;

#[derive(Debug, Serialize)]
struct DependencyHealth {
    backend: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DependencyHealth {
    fn from_result<E: std::fmt::Display>(backend: &'static str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                backend,
                status: "healthy",
                error: None,
            },
            Err(e) => Self {
                backend,
                status: "unhealthy",
                error: Some(e.to_string()),
            },
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ping = tokio::time::timeout(Duration::from_secs(1), state.store.ping())
        .await
        .unwrap_or_else(|_| Err(LedgerError::Store(anyhow::anyhow!("timeout after 1s"))));
    let store = DependencyHealth::from_result(state.store.backend_name(), store_ping);
    let rate_limiter = DependencyHealth::from_result(
        state.rate_limiter.backend_name(),
        state.rate_limiter.ping().await,
    );

    let healthy = store.is_healthy() && rate_limiter.is_healthy();
    let (status_code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "proctor-api",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now(),
            "dependencies": {
                "store": store,
                "rate_limiter": rate_limiter,
            }
        })),
    )
}

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "success": true,
        "service": "proctor-api",
        "message": "Assessment integrity monitor API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": "Route not found" })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// Protects /metrics with HTTP Basic Auth
pub async fn metrics_auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    check_basic_auth(&headers, &state.config.metrics_auth)?;
    Ok(next.run(request).await)
}

/// Guards the privileged attempt listing. Without configured credentials the route is closed.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.config.admin_auth.as_ref().ok_or_else(|| {
        tracing::warn!("Admin route requested but ADMIN_AUTH is not configured");
        StatusCode::FORBIDDEN
    })?;
    check_basic_auth(&headers, expected)?;
    Ok(next.run(request).await)
}

fn check_basic_auth(headers: &HeaderMap, expected: &BasicCredentials) -> Result<(), StatusCode> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let encoded = auth_header
        .strip_prefix("Basic ")
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    if !expected.matches(&credentials) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(())
}

pub mod attempts;
pub mod events;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn basic(credentials: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", general_purpose::STANDARD.encode(credentials));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn basic_auth_accepts_matching_credentials() {
        let expected = BasicCredentials("ops:secret".to_string());
        assert!(check_basic_auth(&basic("ops:secret"), &expected).is_ok());
    }

    #[test]
    fn basic_auth_rejects_wrong_or_missing_credentials() {
        let expected = BasicCredentials("ops:secret".to_string());
        assert_eq!(
            check_basic_auth(&basic("ops:nope"), &expected),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(
            check_basic_auth(&HeaderMap::new(), &expected),
            Err(StatusCode::UNAUTHORIZED)
        );

        let mut bearer = HeaderMap::new();
        bearer.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert_eq!(
            check_basic_auth(&bearer, &expected),
            Err(StatusCode::UNAUTHORIZED)
        );
    }
}
