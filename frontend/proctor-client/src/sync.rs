use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use proctor_api::models::EventType;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::SessionContext;
use crate::error::{SyncError, SyncResult};
use crate::queue_store::{QueueStore, QueuedEvent};
use crate::transport::EventTransport;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,
    pub sync_interval: Duration,
    /// Upper bound on one flush round trip. Also bounds the in-flight guard.
    pub request_timeout: Duration,
    /// Stamped into every event's metadata as `userAgent`.
    pub user_agent: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            user_agent: Some(format!("proctor-client/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Offline,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Delivered {
        sent: usize,
        inserted: usize,
        duplicates: usize,
    },
    /// The server refused the batch for good; the refused events left the queue.
    Dropped { dropped: usize },
}

struct Inner {
    config: SyncConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn EventTransport>,
    queue: Mutex<Vec<QueuedEvent>>,
    flush_lock: Mutex<()>,
    online: AtomicBool,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Durable batched delivery of queued events.
///
/// Every `log` persists the whole queue before returning. A flush sends a snapshot and then
/// removes exactly the delivered `clientEventId`s, so events logged meanwhile stay queued.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                transport,
                queue: Mutex::new(Vec::new()),
                flush_lock: Mutex::new(()),
                online: AtomicBool::new(true),
                timer: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Merges the persisted queue in front of anything logged since construction.
    pub async fn load(&self) -> SyncResult<usize> {
        let stored = self.inner.store.load().await?;
        let mut queue = self.inner.queue.lock().await;
        let known: HashSet<String> = queue.iter().map(|e| e.client_event_id.clone()).collect();
        let mut merged: Vec<QueuedEvent> = stored
            .into_iter()
            .filter(|e| !known.contains(&e.client_event_id))
            .collect();
        let restored = merged.len();
        merged.append(&mut queue);
        *queue = merged;
        self.inner.store.save(&queue).await?;

        tracing::debug!(restored, pending = queue.len(), "Loaded event queue");
        Ok(restored)
    }

    /// Queues an event for the context's attempt. Returns `None` when no attempt is running.
    pub async fn log(
        &self,
        context: &SessionContext,
        event_type: EventType,
        mut metadata: Map<String, Value>,
    ) -> SyncResult<Option<QueuedEvent>> {
        if let Some(user_agent) = &self.inner.config.user_agent {
            metadata.insert("userAgent".to_string(), Value::from(user_agent.clone()));
        }
        metadata.insert(
            "clientTimestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );

        let Some(event) = QueuedEvent::from_context(context, event_type, metadata) else {
            tracing::debug!(event_type = %event_type, "No active attempt, event not queued");
            return Ok(None);
        };

        let pending = {
            let mut queue = self.inner.queue.lock().await;
            queue.push(event.clone());
            self.inner.store.save(&queue).await?;
            queue.len()
        };

        if pending >= self.inner.config.batch_size {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.flush().await {
                    tracing::debug!("Threshold flush failed: {}", e);
                }
            });
        }

        Ok(Some(event))
    }

    /// Attempts one delivery. Skips when another flush is running.
    pub async fn flush(&self) -> SyncResult<FlushOutcome> {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            return Ok(FlushOutcome::Skipped(SkipReason::InFlight));
        };
        self.flush_locked().await
    }

    /// Waits for any running flush, then delivers everything still queued.
    ///
    /// Fails when events remain undelivered, including while offline.
    pub async fn force_flush(&self) -> SyncResult<FlushOutcome> {
        let _guard = self.inner.flush_lock.lock().await;
        let outcome = self.flush_locked().await?;
        if outcome == FlushOutcome::Skipped(SkipReason::Offline) {
            return Err(SyncError::Transient("client is offline".to_string()));
        }
        Ok(outcome)
    }

    async fn flush_locked(&self) -> SyncResult<FlushOutcome> {
        if !self.is_online() {
            return Ok(FlushOutcome::Skipped(SkipReason::Offline));
        }

        let snapshot = self.inner.queue.lock().await.clone();
        if snapshot.is_empty() {
            return Ok(FlushOutcome::Skipped(SkipReason::Empty));
        }

        let sent = snapshot.len();
        let result = match tokio::time::timeout(
            self.inner.config.request_timeout,
            self.inner.transport.send_batch(&snapshot),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transient("batch request timed out".to_string())),
        };

        match result {
            Ok(receipt) => {
                let delivered: HashSet<&str> =
                    snapshot.iter().map(|e| e.client_event_id.as_str()).collect();
                self.remove(|e| delivered.contains(e.client_event_id.as_str()))
                    .await?;
                tracing::debug!(
                    sent,
                    inserted = receipt.inserted,
                    duplicates = receipt.duplicates,
                    "Event batch delivered"
                );
                Ok(FlushOutcome::Delivered {
                    sent,
                    inserted: receipt.inserted,
                    duplicates: receipt.duplicates,
                })
            }
            Err(err) if err.is_terminal() => {
                let refused = refused_ids(&snapshot, &err);
                let dropped = self
                    .remove(|e| refused.contains(e.client_event_id.as_str()))
                    .await?;
                tracing::warn!(dropped, "Server refused event batch, dropping: {}", err);
                Ok(FlushOutcome::Dropped { dropped })
            }
            Err(err) => {
                tracing::debug!(pending = sent, "Event batch not delivered: {}", err);
                Err(err)
            }
        }
    }

    async fn remove<F>(&self, predicate: F) -> SyncResult<usize>
    where
        F: Fn(&QueuedEvent) -> bool,
    {
        let mut queue = self.inner.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| !predicate(e));
        let removed = before - queue.len();
        if removed > 0 {
            self.inner.store.save(&queue).await?;
        }
        Ok(removed)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub async fn pending(&self) -> Vec<QueuedEvent> {
        self.inner.queue.lock().await.clone()
    }

    /// Starts the periodic flush timer. Replaces a running timer.
    pub fn start(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = SyncClient { inner };
                match client.flush().await {
                    Ok(outcome) => tracing::trace!(?outcome, "Sync tick"),
                    Err(e) => tracing::debug!("Sync tick failed, will retry: {}", e),
                }
            }
        });

        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the timer and makes a last delivery attempt.
    pub async fn shutdown(&self) -> SyncResult<FlushOutcome> {
        self.stop();
        self.force_flush().await
    }
}

/// Events of the snapshot the server will never accept.
fn refused_ids<'a>(snapshot: &'a [QueuedEvent], err: &SyncError) -> HashSet<&'a str> {
    let attempts: Option<&Vec<String>> = match err {
        SyncError::Locked { attempt_ids } | SyncError::NotFound { attempt_ids } => Some(attempt_ids),
        _ => None,
    };

    snapshot
        .iter()
        .filter(|e| attempts.map_or(true, |ids| ids.contains(&e.attempt_id)))
        .map(|e| e.client_event_id.as_str())
        .collect()
}
