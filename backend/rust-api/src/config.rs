use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:5000";
const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017/?replicaSet=rs0";
const DEFAULT_MONGO_DATABASE: &str = "proctor";

/// Requests per window on the event endpoints.
const DEFAULT_EVENTS_RATE_LIMIT: u32 = 100;
const DEFAULT_EVENTS_RATE_WINDOW_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = config::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "unknown store backend '{}', expected 'mongo' or 'memory'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub disabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_EVENTS_RATE_LIMIT,
            window: Duration::from_secs(DEFAULT_EVENTS_RATE_WINDOW_SECONDS),
            disabled: false,
        }
    }
}

/// `username:password` pair checked by the Basic-auth guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials(pub String);

impl BasicCredentials {
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub store_backend: StoreBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    /// Rate limiter falls back to an in-process window when unset.
    pub redis_uri: Option<String>,
    pub events_rate_limit: RateLimitConfig,
    pub metrics_auth: BasicCredentials,
    /// Admin listing is disabled when unset.
    pub admin_auth: Option<BasicCredentials>,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml, then APP_ overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let bind_address = settings
            .get_string("server.bind_address")
            .or_else(|_| env::var("BIND_ADDRESS"))
            .or_else(|_| env::var("PORT").map(|port| format!("0.0.0.0:{}", port)))
            .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let store_backend = settings
            .get_string("store.backend")
            .or_else(|_| env::var("STORE_BACKEND"))
            .unwrap_or_else(|_| "mongo".to_string())
            .parse::<StoreBackend>()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| {
                if store_backend == StoreBackend::Mongo {
                    eprintln!("WARNING: MONGO_URI not set, using {}", DEFAULT_MONGO_URI);
                }
                DEFAULT_MONGO_URI.to_string()
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| DEFAULT_MONGO_DATABASE.to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .ok()
            .filter(|uri| !uri.is_empty());

        let max_requests = match settings.get_int("rate_limit.events_per_window") {
            Ok(v) => u32::try_from(v).map_err(|_| {
                config::ConfigError::Message("rate_limit.events_per_window out of range".into())
            })?,
            Err(_) => env::var("EVENTS_RATE_LIMIT")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_EVENTS_RATE_LIMIT),
        };
        let window_seconds = settings
            .get_int("rate_limit.window_seconds")
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .or_else(|| {
                env::var("EVENTS_RATE_WINDOW_SECONDS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(DEFAULT_EVENTS_RATE_WINDOW_SECONDS);
        let disabled = settings.get_bool("rate_limit.disabled").unwrap_or(false)
            || env::var("RATE_LIMIT_DISABLED").unwrap_or_default() == "1";

        let metrics_auth = settings
            .get_string("metrics.auth")
            .or_else(|_| env::var("METRICS_AUTH"))
            .unwrap_or_else(|_| {
                if env == "prod" {
                    eprintln!("WARNING: METRICS_AUTH not set in production, using default");
                }
                "admin:changeme".to_string()
            });

        let admin_auth = settings
            .get_string("admin.auth")
            .or_else(|_| env::var("ADMIN_AUTH"))
            .ok()
            .filter(|v| v.contains(':'))
            .map(BasicCredentials);

        Ok(Config {
            bind_address,
            store_backend,
            mongo_uri,
            mongo_database,
            redis_uri,
            events_rate_limit: RateLimitConfig {
                max_requests,
                window: Duration::from_secs(window_seconds),
                disabled,
            },
            metrics_auth: BasicCredentials(metrics_auth),
            admin_auth,
        })
    }

    /// Memory store, in-process rate limiting, nothing external.
    pub fn in_memory() -> Self {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            store_backend: StoreBackend::Memory,
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            mongo_database: DEFAULT_MONGO_DATABASE.to_string(),
            redis_uri: None,
            events_rate_limit: RateLimitConfig::default(),
            metrics_auth: BasicCredentials("admin:changeme".to_string()),
            admin_auth: None,
        }
    }
}
