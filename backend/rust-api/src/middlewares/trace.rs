use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

static TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

const MAX_TRACE_ID_LEN: usize = 128;

fn inbound_trace_id(request: &Request) -> Option<String> {
    let value = request.headers().get(&TRACE_ID_HEADER)?.to_str().ok()?;
    (!value.is_empty() && value.len() <= MAX_TRACE_ID_LEN).then(|| value.to_string())
}

/// Echoes or assigns `x-trace-id`; ledger logs emitted while handling the request carry it.
pub async fn trace_context_middleware(request: Request, next: Next) -> Response {
    let trace_id = inbound_trace_id(&request).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(TRACE_ID_HEADER.clone(), value);
    }
    response
}
