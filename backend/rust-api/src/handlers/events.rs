use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::{
    error::LedgerError,
    extractors::AppJson,
    models::{
        BatchEventsRequest, BatchEventsResponse, EventListResponse, NewEvent, SingleEventResponse,
    },
    services::{event_ledger::EventLedger, AppState},
};

pub async fn log_event(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<NewEvent>,
) -> Result<impl IntoResponse, LedgerError> {
    tracing::debug!(
        "Logging {} event for attempt {}",
        req.event_type,
        req.attempt_id
    );

    let ledger = EventLedger::new(state.store.clone());
    let (event, violation_count) = ledger.append(req).await?;

    Ok((
        StatusCode::CREATED,
        Json(SingleEventResponse {
            success: true,
            event,
            violation_count,
        }),
    ))
}

pub async fn log_batch(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<BatchEventsRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let submitted = req.events.as_ref().map_or(0, Vec::len);
    tracing::debug!("Logging batch of {} events", submitted);

    let ledger = EventLedger::new(state.store.clone());
    let outcome = ledger.append_batch(req.events).await?;

    Ok((
        StatusCode::CREATED,
        Json(BatchEventsResponse {
            success: true,
            inserted: outcome.inserted.len(),
            duplicates: outcome.duplicates,
            events: outcome.inserted,
        }),
    ))
}

pub async fn list_attempt_events(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let ledger = EventLedger::new(state.store.clone());
    let events = ledger.list_by_attempt(&attempt_id).await?;

    Ok(Json(EventListResponse {
        success: true,
        count: events.len(),
        events,
    }))
}
