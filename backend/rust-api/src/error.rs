use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Failure taxonomy shared by the attempt and event ledgers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("Attempt not found")]
    AttemptNotFound { attempt_ids: Vec<String> },

    #[error("Cannot log events for submitted attempt")]
    Locked { attempt_ids: Vec<String> },

    #[error("Attempt already submitted")]
    AlreadySubmitted(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn not_found(attempt_id: &str) -> Self {
        LedgerError::AttemptNotFound {
            attempt_ids: vec![attempt_id.to_string()],
        }
    }

    pub fn locked(attempt_id: &str) -> Self {
        LedgerError::Locked {
            attempt_ids: vec![attempt_id.to_string()],
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::AttemptNotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Locked { .. } => StatusCode::FORBIDDEN,
            LedgerError::AlreadySubmitted(_) => StatusCode::BAD_REQUEST,
            LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for LedgerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .values()
            .flat_map(|errs| errs.iter())
            .map(|e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string())
            })
            .collect();
        messages.sort();
        LedgerError::Validation(messages.join(", "))
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            LedgerError::AttemptNotFound { attempt_ids } | LedgerError::Locked { attempt_ids } => {
                json!({
                    "success": false,
                    "message": self.to_string(),
                    "attemptIds": attempt_ids,
                })
            }
            LedgerError::Store(err) => {
                tracing::error!("Ledger storage failure: {:#}", err);
                json!({ "success": false, "message": "Server error" })
            }
            _ => json!({ "success": false, "message": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(
            LedgerError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LedgerError::not_found("a").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(LedgerError::locked("a").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            LedgerError::AlreadySubmitted("a".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LedgerError::Store(anyhow::anyhow!("down")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn validation_errors_are_flattened() {
        let req = crate::models::StartAttemptRequest::default();
        let err: LedgerError = req.validate().unwrap_err().into();
        match err {
            LedgerError::Validation(msg) => {
                assert_eq!(msg, "assessmentId is required, userId is required");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
