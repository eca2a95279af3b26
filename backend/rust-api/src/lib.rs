use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{LedgerError, LedgerResult};
pub use services::AppState;

/// CSP middleware adds Content-Security-Policy and related headers to all responses
async fn csp_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Browser clients call from the assessment frontend's origin
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/api/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler).layer(middleware::from_fn_with_state(
                app_state.clone(),
                handlers::metrics_auth_middleware,
            )),
        )
        .nest("/api/attempts", attempt_routes())
        .nest(
            "/api/events",
            event_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::rate_limit::events_rate_limit_middleware,
            )),
        )
        .nest("/api/admin", admin_routes(app_state.clone()))
        .fallback(handlers::not_found)
        .with_state(app_state)
        .layer(cors)
        .layer(middleware::from_fn(csp_middleware))
        .layer(middleware::from_fn(middlewares::metrics::metrics_middleware))
        .layer(middleware::from_fn(middlewares::trace::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start", post(handlers::attempts::start_attempt))
        .route("/{id}/submit", put(handlers::attempts::submit_attempt))
        .route("/{id}", get(handlers::attempts::get_attempt))
        .route("/user/{user_id}", get(handlers::attempts::list_user_attempts))
}

fn event_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/single", post(handlers::events::log_event))
        .route("/batch", post(handlers::events::log_batch))
        .route(
            "/attempt/{id}",
            get(handlers::events::list_attempt_events),
        )
}

fn admin_routes(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/attempts", get(handlers::attempts::list_all_attempts))
        .route_layer(middleware::from_fn_with_state(
            app_state,
            handlers::admin_auth_middleware,
        ))
}
