use std::sync::Arc;

use chrono::Utc;

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::{
    DUPLICATE_EVENTS_TOTAL, EVENTS_LOGGED_TOTAL, LOCKED_WRITES_REJECTED_TOTAL, VIOLATIONS_TOTAL,
};
use crate::models::{AppendOutcome, Event, NewEvent};
use crate::store::LedgerStore;

pub struct EventLedger {
    store: Arc<dyn LedgerStore>,
}

impl EventLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Appends one event, returning it with the owning attempt's counter after the write.
    ///
    /// A redelivered event (same `clientEventId`) is answered with the copy stored the first
    /// time and the current counter, without being stored again.
    pub async fn append(&self, new_event: NewEvent) -> LedgerResult<(Event, u64)> {
        require_attempt_id(&new_event)?;

        let event = new_event.into_event(Utc::now());
        let outcome = self.store_events(vec![event.clone()]).await?;

        let violation_count = outcome.violation_count_for(&event.attempt_id).unwrap_or(0);
        let event = match outcome.inserted.into_iter().next() {
            Some(inserted) => inserted,
            None => self.stored_copy(&event).await?,
        };
        Ok((event, violation_count))
    }

    async fn stored_copy(&self, event: &Event) -> LedgerResult<Event> {
        self.store
            .list_events(&event.attempt_id)
            .await?
            .into_iter()
            .find(|stored| {
                stored.client_event_id.is_some() && stored.client_event_id == event.client_event_id
            })
            .ok_or_else(|| {
                LedgerError::Store(anyhow::anyhow!(
                    "Redelivered event {:?} missing from attempt {}",
                    event.client_event_id,
                    event.attempt_id
                ))
            })
    }

    /// All-or-nothing: one locked or unknown attempt rejects the whole batch.
    pub async fn append_batch(&self, events: Option<Vec<NewEvent>>) -> LedgerResult<AppendOutcome> {
        let events = match events {
            Some(events) if !events.is_empty() => events,
            _ => {
                return Err(LedgerError::Validation(
                    "Events array is required".to_string(),
                ))
            }
        };
        for event in &events {
            require_attempt_id(event)?;
        }

        let now = Utc::now();
        let events: Vec<Event> = events.into_iter().map(|e| e.into_event(now)).collect();
        self.store_events(events).await
    }

    /// Ordered by event timestamp, not arrival.
    pub async fn list_by_attempt(&self, attempt_id: &str) -> LedgerResult<Vec<Event>> {
        self.store.list_events(attempt_id).await
    }

    /// Marks every event of the attempt immutable. Submit already does this atomically with the
    /// lock; calling it again is a no-op that reports zero changes.
    pub async fn lock_all(&self, attempt_id: &str) -> LedgerResult<u64> {
        let changed = self.store.lock_events(attempt_id).await?;
        tracing::debug!("Locked {} events for attempt {}", changed, attempt_id);
        Ok(changed)
    }

    async fn store_events(&self, events: Vec<Event>) -> LedgerResult<AppendOutcome> {
        let submitted = events.len();
        let outcome = match self.store.append_events(events).await {
            Ok(outcome) => outcome,
            Err(LedgerError::Locked { attempt_ids }) => {
                LOCKED_WRITES_REJECTED_TOTAL.inc();
                tracing::warn!(
                    "Rejected {} events for submitted attempts {:?}",
                    submitted,
                    attempt_ids
                );
                return Err(LedgerError::Locked { attempt_ids });
            }
            Err(e) => return Err(e),
        };

        for event in &outcome.inserted {
            EVENTS_LOGGED_TOTAL
                .with_label_values(&[event.event_type.as_str()])
                .inc();
            if event.event_type.is_violation() {
                VIOLATIONS_TOTAL
                    .with_label_values(&[event.event_type.as_str()])
                    .inc();
                tracing::warn!(
                    "Violation recorded: attempt={}, type={}",
                    event.attempt_id,
                    event.event_type
                );
            }
        }
        if outcome.duplicates > 0 {
            DUPLICATE_EVENTS_TOTAL.inc_by(outcome.duplicates as u64);
            tracing::debug!("Skipped {} redelivered events", outcome.duplicates);
        }

        Ok(outcome)
    }
}

fn require_attempt_id(event: &NewEvent) -> LedgerResult<()> {
    if event.attempt_id.trim().is_empty() {
        return Err(LedgerError::Validation("attemptId is required".to_string()));
    }
    Ok(())
}
