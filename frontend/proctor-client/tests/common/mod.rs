#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proctor_api::models::{Attempt, Event, StartAttemptRequest};
use proctor_api::store::LedgerStore;
use proctor_api::{config::Config, create_router, services::AppState};
use proctor_client::{
    AttemptApi, DetectorConfig, FocusProbe, HttpTransport, MemoryQueueStore, QueueStore,
    SessionContext, SessionController, SyncClient, SyncConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("proctor_client=debug,proctor_api=info")
        .try_init();
}

/// The real API router over the in-memory ledger, served on an ephemeral port.
pub struct TestServer {
    pub base_url: String,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        init_tracing();
        let state = Arc::new(AppState::in_memory(Config::in_memory()));
        let app = create_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
        }
    }

    pub fn transport(&self) -> Arc<HttpTransport> {
        Arc::new(HttpTransport::new(&self.base_url, Duration::from_secs(5)).unwrap())
    }

    pub async fn start_attempt(&self, user_id: &str) -> String {
        let request = StartAttemptRequest {
            user_id: user_id.to_string(),
            assessment_id: "assessment-1".to_string(),
            ..Default::default()
        };
        self.transport()
            .start_attempt(&request)
            .await
            .unwrap()
            .attempt_id
    }

    pub async fn attempt(&self, attempt_id: &str) -> Attempt {
        self.state
            .store
            .find_attempt(attempt_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn events(&self, attempt_id: &str) -> Vec<Event> {
        self.state.store.list_events(attempt_id).await.unwrap()
    }
}

/// Address nothing listens on.
pub async fn closed_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/api", addr)
}

pub struct FixedFocus(AtomicBool);

impl FixedFocus {
    pub fn new(focused: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(focused)))
    }

    pub fn set(&self, focused: bool) {
        self.0.store(focused, Ordering::SeqCst);
    }
}

impl FocusProbe for FixedFocus {
    fn has_focus(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timer effectively off so tests control every flush.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        batch_size: 100,
        sync_interval: Duration::from_secs(3600),
        request_timeout: Duration::from_secs(5),
        user_agent: Some("proctor-client-tests".to_string()),
    }
}

pub fn sync_client(server: &TestServer, store: Arc<dyn QueueStore>) -> SyncClient {
    SyncClient::new(sync_config(), store, server.transport())
}

pub struct Harness {
    pub controller: SessionController,
    pub sync: SyncClient,
    pub store: Arc<MemoryQueueStore>,
    pub focus: Arc<FixedFocus>,
}

pub fn harness(server: &TestServer, user_id: &str) -> Harness {
    let store = Arc::new(MemoryQueueStore::new());
    let sync = sync_client(server, store.clone());
    let focus = FixedFocus::new(true);
    let controller = SessionController::new(
        SessionContext::new(user_id, "assessment-1"),
        sync.clone(),
        server.transport(),
        focus.clone(),
        DetectorConfig {
            blur_confirm_delay: Duration::from_millis(20),
        },
    );
    Harness {
        controller,
        sync,
        store,
        focus,
    }
}
