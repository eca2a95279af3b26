use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use proctor_api::models::{
    Attempt, AttemptResponse, BatchEventsResponse, StartAttemptRequest, StartAttemptResponse,
    SubmitAttemptRequest,
};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::queue_store::QueuedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReceipt {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Delivers batches of queued events to the event ledger.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send_batch(&self, events: &[QueuedEvent]) -> SyncResult<BatchReceipt>;
}

/// Attempt lifecycle calls made by the session controller.
#[async_trait]
pub trait AttemptApi: Send + Sync {
    async fn start_attempt(&self, request: &StartAttemptRequest) -> SyncResult<StartAttemptResponse>;

    async fn submit_attempt(
        &self,
        attempt_id: &str,
        answers: &BTreeMap<String, String>,
    ) -> SyncResult<Attempt>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attempt_ids: Vec<String>,
}

/// reqwest client for the proctor API. `base_url` includes the `/api` prefix.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Maps a non-success response to the client's error taxonomy.
async fn error_from_response(response: Response) -> SyncError {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = body
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

    // A 403/404 is only final when the ledger names the attempts; anything else may be a
    // misrouted request or an intermediary and must keep the queue.
    match status {
        StatusCode::FORBIDDEN if !body.attempt_ids.is_empty() => SyncError::Locked {
            attempt_ids: body.attempt_ids,
        },
        StatusCode::NOT_FOUND if !body.attempt_ids.is_empty() => SyncError::NotFound {
            attempt_ids: body.attempt_ids,
        },
        StatusCode::BAD_REQUEST if message == "Attempt already submitted" => {
            SyncError::AlreadySubmitted
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Rejected(message),
        _ => SyncError::Transient(format!("server returned {}: {}", status, message)),
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send_batch(&self, events: &[QueuedEvent]) -> SyncResult<BatchReceipt> {
        let response = self
            .client
            .post(self.url("/events/batch"))
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: BatchEventsResponse = response.json().await?;
        Ok(BatchReceipt {
            inserted: body.inserted,
            duplicates: body.duplicates,
        })
    }
}

#[async_trait]
impl AttemptApi for HttpTransport {
    async fn start_attempt(&self, request: &StartAttemptRequest) -> SyncResult<StartAttemptResponse> {
        let response = self
            .client
            .post(self.url("/attempts/start"))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    async fn submit_attempt(
        &self,
        attempt_id: &str,
        answers: &BTreeMap<String, String>,
    ) -> SyncResult<Attempt> {
        let body = SubmitAttemptRequest {
            answers: Some(answers.clone()),
        };
        let response = self
            .client
            .put(self.url(&format!("/attempts/{}/submit", attempt_id)))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: AttemptResponse = response.json().await?;
        Ok(body.attempt)
    }
}
