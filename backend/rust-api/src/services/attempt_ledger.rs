use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use validator::Validate;

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::{ATTEMPTS_ACTIVE, ATTEMPTS_TOTAL, EVENTS_LOGGED_TOTAL};
use crate::models::{Attempt, AttemptStatus, EventType, NewEvent, StartAttemptRequest};
use crate::store::LedgerStore;

/// Attempt lifecycle: start, submit-and-lock, read projections.
pub struct AttemptLedger {
    store: Arc<dyn LedgerStore>,
}

impl AttemptLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Creates an active attempt and records its `ATTEMPT_STARTED` marker.
    pub async fn start(&self, req: StartAttemptRequest) -> LedgerResult<Attempt> {
        req.validate()?;
        if req.user_id.trim().is_empty() || req.assessment_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "userId and assessmentId are required".to_string(),
            ));
        }

        let now = Utc::now();
        let attempt = Attempt::new(req, now);
        let started = NewEvent::marker(EventType::AttemptStarted, &attempt.id).into_event(now);

        self.store.insert_attempt(&attempt, &started).await?;

        ATTEMPTS_TOTAL
            .with_label_values(&[AttemptStatus::Active.as_str()])
            .inc();
        ATTEMPTS_ACTIVE.inc();
        EVENTS_LOGGED_TOTAL
            .with_label_values(&[EventType::AttemptStarted.as_str()])
            .inc();

        tracing::info!(
            "Attempt started: attempt={}, user={}, assessment={}",
            attempt.id,
            attempt.user_id,
            attempt.assessment_id
        );

        Ok(attempt)
    }

    /// One-way lock. Marks every event immutable and appends `ATTEMPT_SUBMITTED` with the final
    /// violation count. A second submit fails with `AlreadySubmitted`.
    pub async fn submit(
        &self,
        attempt_id: &str,
        answers: Option<BTreeMap<String, String>>,
    ) -> LedgerResult<Attempt> {
        let now = Utc::now();
        let marker = NewEvent::marker(EventType::AttemptSubmitted, attempt_id).into_event(now);

        let attempt = match self
            .store
            .submit_attempt(attempt_id, now, answers, marker)
            .await
        {
            Ok(attempt) => attempt,
            Err(LedgerError::AlreadySubmitted(id)) => {
                tracing::warn!("Submit rejected, attempt {} already submitted", id);
                return Err(LedgerError::AlreadySubmitted(id));
            }
            Err(e) => return Err(e),
        };

        ATTEMPTS_TOTAL
            .with_label_values(&[attempt.status.as_str()])
            .inc();
        ATTEMPTS_ACTIVE.dec();
        EVENTS_LOGGED_TOTAL
            .with_label_values(&[EventType::AttemptSubmitted.as_str()])
            .inc();

        tracing::info!(
            "Attempt submitted and locked: attempt={}, violations={}",
            attempt.id,
            attempt.violation_count
        );

        Ok(attempt)
    }

    pub async fn get(&self, attempt_id: &str) -> LedgerResult<Attempt> {
        self.store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(attempt_id))
    }

    /// Newest first.
    pub async fn list_by_subject(&self, user_id: &str) -> LedgerResult<Vec<Attempt>> {
        self.store.list_attempts_by_user(user_id).await
    }

    /// Privileged; callers gate access.
    pub async fn list_all(&self) -> LedgerResult<Vec<Attempt>> {
        self.store.list_attempts().await
    }
}
