use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proctor_api::models::EventType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::SessionContext;
use crate::error::SyncResult;

/// A fully formed event waiting for delivery. Serializes to the server's event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub client_event_id: String,
    pub event_type: EventType,
    pub attempt_id: String,
    #[serde(default)]
    pub question_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl QueuedEvent {
    /// Stamps the event with the context's attempt and question. `None` without an attempt.
    pub fn from_context(
        context: &SessionContext,
        event_type: EventType,
        metadata: Map<String, Value>,
    ) -> Option<Self> {
        let attempt_id = context.attempt_id.clone()?;
        Some(Self {
            client_event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            attempt_id,
            question_id: context.current_question_id.clone(),
            timestamp: Utc::now(),
            metadata,
        })
    }
}

/// Durable storage for the pending event queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>>;

    /// Replaces the stored queue.
    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()>;
}

/// JSON file store. Writes go to a sibling temp file that is renamed over the queue.
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()> {
        let bytes = serde_json::to_vec(events)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// In-process store for embedders without persistent storage.
#[derive(Default)]
pub struct MemoryQueueStore {
    events: Mutex<Vec<QueuedEvent>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<QueuedEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>> {
        Ok(self.snapshot())
    }

    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()> {
        let mut stored = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *stored = events.to_vec();
        Ok(())
    }
}
