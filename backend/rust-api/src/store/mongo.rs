use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::error::{Error as MongoError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{violations_by_attempt, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::track_db_operation;
use crate::models::{AppendOutcome, Attempt, AttemptMetadata, AttemptStatus, Event, EventType};
use crate::utils::retry::{retry_async_when, RetryConfig};

const ATTEMPTS: &str = "attempts";
const EVENTS: &str = "events";

/// MongoDB-backed ledger store.
///
/// `insert_attempt`, `append_events` and `submit_attempt` run in multi-document transactions
/// (replica set required). Both write the attempt document behind a `submitted: false` filter, so an append
/// racing a submit on the same attempt hits a write conflict and is retried against the
/// committed state instead of slipping an event past the lock.
#[derive(Clone)]
pub struct MongoLedgerStore {
    client: Client,
    db: Database,
}

impl MongoLedgerStore {
    pub async fn connect(uri: &str, database: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("Failed to connect to MongoDB")?;
        let store = Self {
            db: client.database(database),
            client,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    fn attempts(&self) -> Collection<AttemptDocument> {
        self.db.collection(ATTEMPTS)
    }

    fn events(&self) -> Collection<EventDocument> {
        self.db.collection(EVENTS)
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        let attempts = self.attempts();
        for keys in [doc! { "user_id": 1, "assessment_id": 1 }, doc! { "status": 1 }] {
            attempts
                .create_index(IndexModel::builder().keys(keys).build())
                .await
                .context("Failed to create attempts index")?;
        }

        let events = self.events();
        for keys in [doc! { "attempt_id": 1, "timestamp": 1 }, doc! { "event_type": 1 }] {
            events
                .create_index(IndexModel::builder().keys(keys).build())
                .await
                .context("Failed to create events index")?;
        }
        events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1, "client_event_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .partial_filter_expression(
                                doc! { "client_event_id": { "$type": "string" } },
                            )
                            .build(),
                    )
                    .build(),
            )
            .await
            .context("Failed to create events client id index")?;

        tracing::info!("MongoDB ledger indexes ensured");
        Ok(())
    }

    async fn run_transaction<T, F>(&self, body: F) -> LedgerResult<T>
    where
        F: for<'s> Fn(&'s mut ClientSession) -> BoxFuture<'s, Result<T, TxnFailure>> + Sync,
        T: Send,
    {
        let body = &body;
        let result = retry_async_when(
            RetryConfig::transaction(),
            TxnFailure::is_transient,
            move || {
                let client = self.client.clone();
                async move {
                    let mut session = client.start_session().await?;
                    session.start_transaction().await?;
                    match body(&mut session).await {
                        Ok(value) => {
                            commit(&mut session).await?;
                            Ok(value)
                        }
                        Err(e) => {
                            if let Err(abort_err) = session.abort_transaction().await {
                                tracing::debug!("Abort after failed transaction: {}", abort_err);
                            }
                            Err(e)
                        }
                    }
                }
            },
        )
        .await;

        result.map_err(LedgerError::from)
    }
}

async fn commit(session: &mut ClientSession) -> Result<(), MongoError> {
    let mut tries = 0;
    loop {
        match session.commit_transaction().await {
            Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) && tries < 3 => {
                tries += 1;
                tracing::warn!("Unknown commit result, retrying commit: {}", e);
            }
            other => return other,
        }
    }
}

enum TxnFailure {
    Rejected(LedgerError),
    Mongo(MongoError),
}

impl TxnFailure {
    fn is_transient(&self) -> bool {
        matches!(self, TxnFailure::Mongo(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR))
    }
}

impl From<MongoError> for TxnFailure {
    fn from(err: MongoError) -> Self {
        TxnFailure::Mongo(err)
    }
}

impl From<TxnFailure> for LedgerError {
    fn from(failure: TxnFailure) -> Self {
        match failure {
            TxnFailure::Rejected(err) => err,
            TxnFailure::Mongo(err) => {
                LedgerError::Store(anyhow::Error::new(err).context("MongoDB transaction failed"))
            }
        }
    }
}

fn bson_now(now: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(now.timestamp_millis())
}

async fn insert_in_session(
    attempts: Collection<AttemptDocument>,
    events: Collection<EventDocument>,
    session: &mut ClientSession,
    attempt: AttemptDocument,
    started: EventDocument,
) -> Result<(), TxnFailure> {
    attempts.insert_one(&attempt).session(&mut *session).await?;
    events.insert_one(&started).session(&mut *session).await?;
    Ok(())
}

async fn append_in_session(
    attempts: Collection<AttemptDocument>,
    events: Collection<EventDocument>,
    session: &mut ClientSession,
    batch: Vec<Event>,
) -> Result<AppendOutcome, TxnFailure> {
    let mut attempt_ids: Vec<String> = Vec::new();
    for event in &batch {
        if !attempt_ids.contains(&event.attempt_id) {
            attempt_ids.push(event.attempt_id.clone());
        }
    }

    let client_ids: Vec<String> = batch
        .iter()
        .filter_map(|e| e.client_event_id.clone())
        .collect();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    if !client_ids.is_empty() {
        let mut cursor = events
            .find(doc! {
                "attempt_id": { "$in": attempt_ids.clone() },
                "client_event_id": { "$in": client_ids },
            })
            .session(&mut *session)
            .await?;
        while let Some(existing) = cursor.next(&mut *session).await {
            let existing = existing?;
            if let Some(client_id) = existing.client_event_id {
                seen.insert((existing.attempt_id, client_id));
            }
        }
    }

    let mut outcome = AppendOutcome::default();
    for event in batch {
        if let Some(client_id) = &event.client_event_id {
            if !seen.insert((event.attempt_id.clone(), client_id.clone())) {
                outcome.duplicates += 1;
                continue;
            }
        }
        outcome.inserted.push(event);
    }

    let increments = violations_by_attempt(&outcome.inserted);
    let now = bson_now(Utc::now());
    let mut missing = Vec::new();
    let mut locked = Vec::new();
    for attempt_id in attempt_ids {
        let increment = increments
            .iter()
            .find(|(id, _)| *id == attempt_id)
            .map(|(_, n)| *n as i64)
            .unwrap_or(0);

        let updated = attempts
            .find_one_and_update(
                doc! { "_id": attempt_id.as_str(), "submitted": false },
                doc! {
                    "$inc": { "violation_count": increment },
                    "$set": { "updated_at": now },
                },
            )
            .return_document(ReturnDocument::After)
            .session(&mut *session)
            .await?;

        match updated {
            Some(doc) => outcome
                .violation_counts
                .push((attempt_id, doc.violation_count.max(0) as u64)),
            None => {
                let exists = attempts
                    .find_one(doc! { "_id": attempt_id.as_str() })
                    .session(&mut *session)
                    .await?
                    .is_some();
                if exists {
                    locked.push(attempt_id);
                } else {
                    missing.push(attempt_id);
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(TxnFailure::Rejected(LedgerError::AttemptNotFound {
            attempt_ids: missing,
        }));
    }
    if !locked.is_empty() {
        return Err(TxnFailure::Rejected(LedgerError::Locked {
            attempt_ids: locked,
        }));
    }

    if !outcome.inserted.is_empty() {
        let docs: Vec<EventDocument> = outcome
            .inserted
            .iter()
            .cloned()
            .map(EventDocument::from)
            .collect();
        events.insert_many(docs).session(&mut *session).await?;
    }

    Ok(outcome)
}

async fn submit_in_session(
    attempts: Collection<AttemptDocument>,
    events: Collection<EventDocument>,
    session: &mut ClientSession,
    attempt_id: String,
    now: DateTime<Utc>,
    answers: Option<BTreeMap<String, String>>,
    mut marker: Event,
) -> Result<Attempt, TxnFailure> {
    let now_bson = bson_now(now);
    let mut set = doc! {
        "submitted": true,
        "status": AttemptStatus::Completed.as_str(),
        "end_time": now_bson,
        "updated_at": now_bson,
    };
    if let Some(answers) = answers {
        let answers = mongodb::bson::to_bson(&answers).map_err(|e| {
            TxnFailure::Rejected(LedgerError::Store(
                anyhow::Error::new(e).context("Failed to encode answers"),
            ))
        })?;
        set.insert("answers", answers);
    }

    let updated = attempts
        .find_one_and_update(
            doc! { "_id": attempt_id.as_str(), "submitted": false },
            doc! { "$set": set },
        )
        .return_document(ReturnDocument::After)
        .session(&mut *session)
        .await?;

    let attempt = match updated {
        Some(doc) => Attempt::from(doc),
        None => {
            let exists = attempts
                .find_one(doc! { "_id": attempt_id.as_str() })
                .session(&mut *session)
                .await?
                .is_some();
            let err = if exists {
                LedgerError::AlreadySubmitted(attempt_id)
            } else {
                LedgerError::not_found(&attempt_id)
            };
            return Err(TxnFailure::Rejected(err));
        }
    };

    events
        .update_many(
            doc! { "attempt_id": attempt.id.as_str(), "immutable": false },
            doc! { "$set": { "immutable": true } },
        )
        .session(&mut *session)
        .await?;

    marker
        .metadata
        .insert("violationCount".to_string(), json!(attempt.violation_count));
    marker.immutable = true;
    events
        .insert_one(EventDocument::from(marker))
        .session(&mut *session)
        .await?;

    Ok(attempt)
}

#[async_trait]
impl LedgerStore for MongoLedgerStore {
    async fn insert_attempt(&self, attempt: &Attempt, started: &Event) -> LedgerResult<()> {
        let attempts = self.attempts();
        let events = self.events();
        let attempt_doc = AttemptDocument::from(attempt.clone());
        let started_doc = EventDocument::from(started.clone());

        track_db_operation(
            "transaction_start",
            ATTEMPTS,
            self.run_transaction(|session| {
                Box::pin(insert_in_session(
                    attempts.clone(),
                    events.clone(),
                    session,
                    attempt_doc.clone(),
                    started_doc.clone(),
                ))
            }),
        )
        .await
    }

    async fn find_attempt(&self, attempt_id: &str) -> LedgerResult<Option<Attempt>> {
        let attempts = self.attempts();
        let doc = track_db_operation("find_one", ATTEMPTS, async {
            attempts
                .find_one(doc! { "_id": attempt_id })
                .await
                .context("Failed to fetch attempt")
        })
        .await?;
        Ok(doc.map(Attempt::from))
    }

    async fn list_attempts_by_user(&self, user_id: &str) -> LedgerResult<Vec<Attempt>> {
        self.query_attempts(doc! { "user_id": user_id }).await
    }

    async fn list_attempts(&self) -> LedgerResult<Vec<Attempt>> {
        self.query_attempts(doc! {}).await
    }

    async fn append_events(&self, events: Vec<Event>) -> LedgerResult<AppendOutcome> {
        let attempts = self.attempts();
        let event_coll = self.events();
        track_db_operation(
            "transaction_append",
            EVENTS,
            self.run_transaction(|session| {
                Box::pin(append_in_session(
                    attempts.clone(),
                    event_coll.clone(),
                    session,
                    events.clone(),
                ))
            }),
        )
        .await
    }

    async fn submit_attempt(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
        answers: Option<BTreeMap<String, String>>,
        submitted_marker: Event,
    ) -> LedgerResult<Attempt> {
        let attempts = self.attempts();
        let events = self.events();
        track_db_operation(
            "transaction_submit",
            ATTEMPTS,
            self.run_transaction(|session| {
                Box::pin(submit_in_session(
                    attempts.clone(),
                    events.clone(),
                    session,
                    attempt_id.to_string(),
                    now,
                    answers.clone(),
                    submitted_marker.clone(),
                ))
            }),
        )
        .await
    }

    async fn lock_events(&self, attempt_id: &str) -> LedgerResult<u64> {
        let events = self.events();
        let result = track_db_operation("update_many", EVENTS, async {
            events
                .update_many(
                    doc! { "attempt_id": attempt_id, "immutable": false },
                    doc! { "$set": { "immutable": true } },
                )
                .await
                .context("Failed to lock events")
        })
        .await?;
        Ok(result.modified_count)
    }

    async fn list_events(&self, attempt_id: &str) -> LedgerResult<Vec<Event>> {
        let events = self.events();
        let docs = track_db_operation("find", EVENTS, async {
            let mut cursor = events
                .find(doc! { "attempt_id": attempt_id })
                .sort(doc! { "timestamp": 1 })
                .await
                .context("Failed to query events")?;

            let mut docs = Vec::new();
            while cursor
                .advance()
                .await
                .context("Failed to advance events cursor")?
            {
                docs.push(
                    cursor
                        .deserialize_current()
                        .context("Failed to deserialize event")?,
                );
            }
            Ok::<_, anyhow::Error>(docs)
        })
        .await?;

        Ok(docs.into_iter().map(Event::from).collect())
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| anyhow!("MongoDB ping failed: {}", e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "mongodb"
    }
}

impl MongoLedgerStore {
    async fn query_attempts(&self, filter: mongodb::bson::Document) -> LedgerResult<Vec<Attempt>> {
        let attempts = self.attempts();
        let docs = track_db_operation("find", ATTEMPTS, async {
            let mut cursor = attempts
                .find(filter)
                .sort(doc! { "start_time": -1 })
                .await
                .context("Failed to query attempts")?;

            let mut docs = Vec::new();
            while cursor
                .advance()
                .await
                .context("Failed to advance attempts cursor")?
            {
                docs.push(
                    cursor
                        .deserialize_current()
                        .context("Failed to deserialize attempt")?,
                );
            }
            Ok::<_, anyhow::Error>(docs)
        })
        .await?;

        Ok(docs.into_iter().map(Attempt::from).collect())
    }
}

/// Storage shape of an attempt; timestamps are BSON dates so range queries and sorts work.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    #[serde(default)]
    student_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    assessment_id: String,
    #[serde(default)]
    answers: BTreeMap<String, String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    correct_answers: Option<i64>,
    #[serde(default)]
    total_questions: Option<i64>,
    #[serde(with = "bson_datetime_as_chrono")]
    start_time: DateTime<Utc>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    end_time: Option<DateTime<Utc>>,
    status: AttemptStatus,
    violation_count: i64,
    submitted: bool,
    #[serde(default)]
    metadata: AttemptMetadata,
    #[serde(with = "bson_datetime_as_chrono")]
    updated_at: DateTime<Utc>,
}

impl From<Attempt> for AttemptDocument {
    fn from(a: Attempt) -> Self {
        Self {
            id: a.id,
            user_id: a.user_id,
            student_name: a.student_name,
            username: a.username,
            assessment_id: a.assessment_id,
            answers: a.answers,
            score: a.score,
            correct_answers: a.correct_answers.map(i64::from),
            total_questions: a.total_questions.map(i64::from),
            start_time: a.start_time,
            end_time: a.end_time,
            status: a.status,
            violation_count: a.violation_count as i64,
            submitted: a.submitted,
            metadata: a.metadata,
            updated_at: a.end_time.unwrap_or(a.start_time),
        }
    }
}

impl From<AttemptDocument> for Attempt {
    fn from(d: AttemptDocument) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            student_name: d.student_name,
            username: d.username,
            assessment_id: d.assessment_id,
            answers: d.answers,
            score: d.score,
            correct_answers: d.correct_answers.and_then(|v| u32::try_from(v).ok()),
            total_questions: d.total_questions.and_then(|v| u32::try_from(v).ok()),
            start_time: d.start_time,
            end_time: d.end_time,
            status: d.status,
            violation_count: d.violation_count.max(0) as u64,
            submitted: d.submitted,
            metadata: d.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventDocument {
    #[serde(rename = "_id")]
    id: String,
    event_type: EventType,
    attempt_id: String,
    #[serde(default)]
    question_id: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    immutable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_event_id: Option<String>,
}

impl From<Event> for EventDocument {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            event_type: e.event_type,
            attempt_id: e.attempt_id,
            question_id: e.question_id,
            timestamp: e.timestamp,
            metadata: e.metadata,
            immutable: e.immutable,
            client_event_id: e.client_event_id,
        }
    }
}

impl From<EventDocument> for Event {
    fn from(d: EventDocument) -> Self {
        Self {
            id: d.id,
            event_type: d.event_type,
            attempt_id: d.attempt_id,
            question_id: d.question_id,
            timestamp: d.timestamp,
            metadata: d.metadata,
            immutable: d.immutable,
            client_event_id: d.client_event_id,
        }
    }
}

// Serde converters for chrono::DateTime <-> mongodb::bson::DateTime
mod bson_datetime_as_chrono {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bson::DateTime::from_millis(date.timestamp_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bson_dt = bson::DateTime::deserialize(deserializer)?;
        DateTime::from_timestamp_millis(bson_dt.timestamp_millis())
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}

mod bson_datetime_as_chrono_option {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => serializer.serialize_some(&bson::DateTime::from_millis(d.timestamp_millis())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        opt.map(|dt| {
            DateTime::from_timestamp_millis(dt.timestamp_millis())
                .ok_or_else(|| D::Error::custom("timestamp out of range"))
        })
        .transpose()
    }
}
