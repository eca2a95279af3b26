use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::middlewares::rate_limit::RateLimiter;
use crate::store::{LedgerStore, MemoryLedgerStore, MongoLedgerStore};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn LedgerStore>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn LedgerStore> = match config.store_backend {
            StoreBackend::Mongo => {
                tracing::info!("Connecting ledger store to MongoDB...");
                let store = MongoLedgerStore::connect(&config.mongo_uri, &config.mongo_database)
                    .await?;
                store.ping().await?;
                tracing::info!("MongoDB connected");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory ledger store; data is lost on restart");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let rate_limiter =
            RateLimiter::connect(config.redis_uri.as_deref(), config.events_rate_limit.clone())
                .await?;

        Ok(Self {
            config,
            store,
            rate_limiter,
        })
    }

    /// State with no external dependencies.
    pub fn in_memory(config: Config) -> Self {
        let rate_limiter = RateLimiter::memory(config.events_rate_limit.clone());
        Self {
            config,
            store: Arc::new(MemoryLedgerStore::new()),
            rate_limiter,
        }
    }
}

pub mod attempt_ledger;
pub mod event_ledger;
