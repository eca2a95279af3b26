use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use super::{violations_by_attempt, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{AppendOutcome, Attempt, Event};

#[derive(Debug, Default)]
struct MemoryState {
    attempts: HashMap<String, Attempt>,
    /// Insertion order; reads sort by timestamp.
    events: Vec<Event>,
    client_ids: HashSet<(String, String)>,
}

/// In-process ledger store.
///
/// One write lock covers attempts and events, so the lock check, the insert and the counter
/// increment of an append are a single critical section with respect to submit.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_attempt(&self, attempt: &Attempt, started: &Event) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state.attempts.insert(attempt.id.clone(), attempt.clone());
        state.events.push(started.clone());
        Ok(())
    }

    async fn find_attempt(&self, attempt_id: &str) -> LedgerResult<Option<Attempt>> {
        let state = self.state.read().await;
        Ok(state.attempts.get(attempt_id).cloned())
    }

    async fn list_attempts_by_user(&self, user_id: &str) -> LedgerResult<Vec<Attempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(attempts)
    }

    async fn list_attempts(&self) -> LedgerResult<Vec<Attempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state.attempts.values().cloned().collect();
        attempts.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(attempts)
    }

    async fn append_events(&self, events: Vec<Event>) -> LedgerResult<AppendOutcome> {
        let mut state = self.state.write().await;

        let mut attempt_ids: Vec<String> = Vec::new();
        for event in &events {
            if !attempt_ids.contains(&event.attempt_id) {
                attempt_ids.push(event.attempt_id.clone());
            }
        }

        let mut missing = Vec::new();
        let mut locked = Vec::new();
        for id in &attempt_ids {
            match state.attempts.get(id) {
                None => missing.push(id.clone()),
                Some(attempt) if attempt.submitted => locked.push(id.clone()),
                Some(_) => {}
            }
        }
        if !missing.is_empty() {
            return Err(LedgerError::AttemptNotFound {
                attempt_ids: missing,
            });
        }
        if !locked.is_empty() {
            return Err(LedgerError::Locked {
                attempt_ids: locked,
            });
        }

        let mut outcome = AppendOutcome::default();
        for event in events {
            if let Some(client_id) = &event.client_event_id {
                let key = (event.attempt_id.clone(), client_id.clone());
                if !state.client_ids.insert(key) {
                    outcome.duplicates += 1;
                    continue;
                }
            }
            outcome.inserted.push(event);
        }

        let increments = violations_by_attempt(&outcome.inserted);
        for attempt_id in attempt_ids {
            let increment = increments
                .iter()
                .find(|(id, _)| *id == attempt_id)
                .map_or(0, |(_, n)| *n);
            if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
                attempt.violation_count += increment;
                outcome
                    .violation_counts
                    .push((attempt_id, attempt.violation_count));
            }
        }
        state.events.extend(outcome.inserted.iter().cloned());

        Ok(outcome)
    }

    async fn submit_attempt(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
        answers: Option<BTreeMap<String, String>>,
        mut submitted_marker: Event,
    ) -> LedgerResult<Attempt> {
        let mut state = self.state.write().await;

        let attempt = state
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| LedgerError::not_found(attempt_id))?;
        if attempt.submitted {
            return Err(LedgerError::AlreadySubmitted(attempt_id.to_string()));
        }
        attempt.lock(now, answers);
        let locked = attempt.clone();

        for event in state.events.iter_mut().filter(|e| e.attempt_id == attempt_id) {
            event.immutable = true;
        }

        submitted_marker
            .metadata
            .insert("violationCount".to_string(), json!(locked.violation_count));
        submitted_marker.immutable = true;
        state.events.push(submitted_marker);

        Ok(locked)
    }

    async fn lock_events(&self, attempt_id: &str) -> LedgerResult<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for event in state
            .events
            .iter_mut()
            .filter(|e| e.attempt_id == attempt_id && !e.immutable)
        {
            event.immutable = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_events(&self, attempt_id: &str) -> LedgerResult<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.attempt_id == attempt_id)
            .cloned()
            .collect();
        // stable: equal timestamps keep insertion order
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    async fn ping(&self) -> LedgerResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, NewEvent, StartAttemptRequest};

    async fn seeded() -> (MemoryLedgerStore, Attempt) {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let attempt = Attempt::new(
            StartAttemptRequest {
                user_id: "u-1".into(),
                assessment_id: "exam-1".into(),
                ..Default::default()
            },
            now,
        );
        let started = NewEvent::marker(EventType::AttemptStarted, &attempt.id).into_event(now);
        store.insert_attempt(&attempt, &started).await.unwrap();
        (store, attempt)
    }

    fn event(t: EventType, attempt_id: &str, client_id: Option<&str>) -> Event {
        let mut e = NewEvent::marker(t, attempt_id);
        e.client_event_id = client_id.map(str::to_string);
        e.into_event(Utc::now())
    }

    #[tokio::test]
    async fn duplicate_client_ids_are_skipped() {
        let (store, attempt) = seeded().await;

        let first = store
            .append_events(vec![event(EventType::TabSwitch, &attempt.id, Some("c-1"))])
            .await
            .unwrap();
        assert_eq!(first.inserted.len(), 1);

        let retry = store
            .append_events(vec![
                event(EventType::TabSwitch, &attempt.id, Some("c-1")),
                event(EventType::CopyAttempt, &attempt.id, Some("c-2")),
            ])
            .await
            .unwrap();
        assert_eq!(retry.inserted.len(), 1);
        assert_eq!(retry.duplicates, 1);
        assert_eq!(retry.violation_count_for(&attempt.id), Some(2));
    }

    #[tokio::test]
    async fn rejected_batch_writes_nothing() {
        let (store, attempt) = seeded().await;

        let err = store
            .append_events(vec![
                event(EventType::TabSwitch, &attempt.id, None),
                event(EventType::TabSwitch, "ghost", None),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AttemptNotFound { ref attempt_ids } if attempt_ids == &vec!["ghost".to_string()]));

        let stored = store.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.violation_count, 0);
        assert_eq!(store.list_events(&attempt.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_locks_existing_events() {
        let (store, attempt) = seeded().await;
        store
            .append_events(vec![event(EventType::WindowBlur, &attempt.id, None)])
            .await
            .unwrap();

        let marker = NewEvent::marker(EventType::AttemptSubmitted, &attempt.id).into_event(Utc::now());
        let locked = store
            .submit_attempt(&attempt.id, Utc::now(), None, marker)
            .await
            .unwrap();
        assert!(locked.submitted);

        let events = store.list_events(&attempt.id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.immutable));
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::AttemptSubmitted);
        assert_eq!(last.metadata["violationCount"], 1);

        assert_eq!(store.lock_events(&attempt.id).await.unwrap(), 0);
    }
}
