use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use redis::aio::ConnectionManager;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::metrics::RATE_LIMITED_TOTAL;
use crate::services::AppState;
use crate::utils::origin::RequestOrigin;

const RATE_LIMIT_MESSAGE: &str = "Too many requests from this IP, please try again later.";

// First hit creates the key with a TTL of one window; later hits count until the key expires.
const FIXED_WINDOW_SCRIPT: &str = r#"
    local key = KEYS[1]
    local limit = tonumber(ARGV[1])
    local window = tonumber(ARGV[2])

    local current = redis.call('GET', key)

    if current == false then
        redis.call('SET', key, 1, 'EX', window)
        return 1
    end

    current = tonumber(current)

    if current >= limit then
        return 0
    end

    redis.call('INCR', key)
    return 1
"#;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u32,
}

/// Per-key fixed windows kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryWindows {
    windows: Mutex<HashMap<String, WindowState>>,
}

impl MemoryWindows {
    fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        let mut guard = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        // Drop expired windows so the map does not grow with every client seen.
        guard.retain(|_, state| now.duration_since(state.start) < window);

        let state = guard.entry(key.to_string()).or_insert(WindowState {
            start: now,
            count: 0,
        });
        if state.count < limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

pub enum RateLimitBackend {
    Redis(ConnectionManager),
    Memory(MemoryWindows),
}

pub struct RateLimiter {
    backend: RateLimitBackend,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(backend: RateLimitBackend, config: RateLimitConfig) -> Self {
        Self { backend, config }
    }

    pub fn memory(config: RateLimitConfig) -> Self {
        Self::new(RateLimitBackend::Memory(MemoryWindows::default()), config)
    }

    /// Uses Redis when a URI is configured so limits hold across replicas.
    pub async fn connect(redis_uri: Option<&str>, config: RateLimitConfig) -> anyhow::Result<Self> {
        let Some(uri) = redis_uri else {
            tracing::info!("REDIS_URI not set, rate limiting with in-process windows");
            return Ok(Self::memory(config));
        };

        tracing::info!("Attempting to connect to Redis...");
        let client = redis::Client::open(uri)?;
        let redis = tokio::time::timeout(
            Duration::from_secs(30),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");
        Ok(Self::new(RateLimitBackend::Redis(redis), config))
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            RateLimitBackend::Redis(_) => "redis",
            RateLimitBackend::Memory(_) => "memory",
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        if let RateLimitBackend::Redis(redis) = &self.backend {
            let mut conn = redis.clone();
            tokio::time::timeout(
                Duration::from_millis(500),
                redis::cmd("PING").query_async::<String>(&mut conn),
            )
            .await
            .map_err(|_| anyhow::anyhow!("Redis timeout after 500ms"))??;
        }
        Ok(())
    }

    pub async fn check(&self, key: &str) -> anyhow::Result<bool> {
        let limit = self.config.max_requests;
        let window = self.config.window;

        match &self.backend {
            RateLimitBackend::Memory(windows) => Ok(windows.allow(key, limit, window)),
            RateLimitBackend::Redis(redis) => {
                let mut conn = redis.clone();
                let allowed: u32 = redis::Script::new(FIXED_WINDOW_SCRIPT)
                    .key(key)
                    .arg(limit)
                    .arg(window.as_secs().max(1))
                    .invoke_async(&mut conn)
                    .await?;
                Ok(allowed == 1)
            }
        }
    }
}

/// Per-IP limit for the event endpoints.
pub async fn events_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = &state.rate_limiter;
    if limiter.is_disabled() {
        tracing::debug!("Rate limiting disabled via configuration");
        return next.run(request).await;
    }

    let origin = RequestOrigin::from_parts(request.headers(), request.extensions());
    let client_ip = origin.caller_key();
    let key = format!("ratelimit:events:{}", client_ip);

    match limiter.check(&key).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            tracing::warn!("Rate limit exceeded for IP: {}", client_ip);
            RATE_LIMITED_TOTAL
                .with_label_values(&[limiter.backend_name()])
                .inc();
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "success": false, "message": RATE_LIMIT_MESSAGE })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Rate limit check failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": "Server error" })),
            )
                .into_response()
        }
    }
}
