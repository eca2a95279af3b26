use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::{
    error::LedgerError,
    extractors::{parse_optional_body, AppJson},
    models::{
        AttemptListResponse, AttemptResponse, StartAttemptRequest, StartAttemptResponse,
        SubmitAttemptRequest,
    },
    services::{attempt_ledger::AttemptLedger, AppState},
    utils::origin::RequestOrigin,
};

pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    extensions: Extensions,
    AppJson(mut req): AppJson<StartAttemptRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let origin = RequestOrigin::from_parts(&headers, &extensions);

    tracing::info!(
        "Starting attempt for user_id={}, assessment_id={}",
        req.user_id,
        req.assessment_id
    );

    let metadata = req.metadata.get_or_insert_with(Default::default);
    if metadata.ip_address.is_none() {
        metadata.ip_address = origin.ip_address;
    }
    if metadata.user_agent.is_none() {
        metadata.user_agent = origin.user_agent;
    }

    let ledger = AttemptLedger::new(state.store.clone());
    let attempt = ledger.start(req).await?;

    Ok((
        StatusCode::CREATED,
        Json(StartAttemptResponse {
            success: true,
            attempt_id: attempt.id,
            start_time: attempt.start_time,
        }),
    ))
}

pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, Response> {
    tracing::info!("Submitting attempt: {}", attempt_id);

    let req: SubmitAttemptRequest = parse_optional_body(&body)?;
    let ledger = AttemptLedger::new(state.store.clone());
    let attempt = ledger
        .submit(&attempt_id, req.answers)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok((
        StatusCode::OK,
        Json(AttemptResponse {
            success: true,
            message: Some("Attempt submitted and locked".to_string()),
            attempt,
        }),
    ))
}

pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let ledger = AttemptLedger::new(state.store.clone());
    let attempt = ledger.get(&attempt_id).await?;

    Ok(Json(AttemptResponse {
        success: true,
        message: None,
        attempt,
    }))
}

pub async fn list_user_attempts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let ledger = AttemptLedger::new(state.store.clone());
    let attempts = ledger.list_by_subject(&user_id).await?;

    Ok(Json(AttemptListResponse {
        success: true,
        count: attempts.len(),
        attempts,
    }))
}

/// Privileged listing of every attempt; mounted behind the admin guard.
pub async fn list_all_attempts(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, LedgerError> {
    let ledger = AttemptLedger::new(state.store.clone());
    let attempts = ledger.list_all().await?;
    tracing::info!("Admin listed {} attempts", attempts.len());

    Ok(Json(AttemptListResponse {
        success: true,
        count: attempts.len(),
        attempts,
    }))
}
