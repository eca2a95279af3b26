//! Persistence seam for the attempt and event ledgers.
//!
//! Every method is one atomic unit. In particular `append_events` and `submit_attempt` must never
//! interleave for the same attempt: once a submit has returned, no append for that attempt may
//! succeed, and every violation counted by an append is visible to the submit that follows it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LedgerResult;
use crate::models::{AppendOutcome, Attempt, Event};

pub mod memory;
pub mod mongo;

pub use memory::MemoryLedgerStore;
pub use mongo::MongoLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persists a new attempt together with its `ATTEMPT_STARTED` marker.
    async fn insert_attempt(&self, attempt: &Attempt, started: &Event) -> LedgerResult<()>;

    async fn find_attempt(&self, attempt_id: &str) -> LedgerResult<Option<Attempt>>;

    /// Attempts of one subject, newest `start_time` first.
    async fn list_attempts_by_user(&self, user_id: &str) -> LedgerResult<Vec<Attempt>>;

    /// Every attempt, newest `start_time` first.
    async fn list_attempts(&self) -> LedgerResult<Vec<Attempt>>;

    /// Inserts `events` all-or-nothing.
    ///
    /// Fails with `AttemptNotFound` / `Locked` (listing every offending attempt) before anything
    /// is written. Events whose `(attempt_id, client_event_id)` already exist are skipped and not
    /// counted. Each inserted violation increments its attempt's counter.
    async fn append_events(&self, events: Vec<Event>) -> LedgerResult<AppendOutcome>;

    /// Locks the attempt, marks its events immutable and appends `submitted_marker`.
    ///
    /// The marker's metadata receives the final `violationCount` inside the same unit.
    async fn submit_attempt(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
        answers: Option<BTreeMap<String, String>>,
        submitted_marker: Event,
    ) -> LedgerResult<Attempt>;

    /// Sets `immutable = true` on every event of the attempt, returning how many changed.
    async fn lock_events(&self, attempt_id: &str) -> LedgerResult<u64>;

    /// Events of one attempt ordered by `timestamp` ascending.
    async fn list_events(&self, attempt_id: &str) -> LedgerResult<Vec<Event>>;

    async fn ping(&self) -> LedgerResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Counts violation events per attempt, preserving first-seen order.
pub(crate) fn violations_by_attempt(events: &[Event]) -> Vec<(String, u64)> {
    let mut counts: Vec<(String, u64)> = Vec::new();
    for event in events {
        let increment = u64::from(event.event_type.is_violation());
        match counts.iter_mut().find(|(id, _)| *id == event.attempt_id) {
            Some((_, count)) => *count += increment,
            None => counts.push((event.attempt_id.clone(), increment)),
        }
    }
    counts
}
