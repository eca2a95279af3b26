use crate::session::SessionPhase;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Failures of the client-side event pipeline and the attempt API calls.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Network failure, timeout, rate limiting or a server error. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("attempts locked: {attempt_ids:?}")]
    Locked { attempt_ids: Vec<String> },

    #[error("attempts not found: {attempt_ids:?}")]
    NotFound { attempt_ids: Vec<String> },

    #[error("attempt already submitted")]
    AlreadySubmitted,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("queue storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Retrying the same payload can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Locked { .. }
                | SyncError::NotFound { .. }
                | SyncError::AlreadySubmitted
                | SyncError::Rejected(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transient(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation not allowed in phase {0:?}")]
    InvalidPhase(SessionPhase),

    #[error("no attempt has been started")]
    NoAttempt,

    #[error("pending events could not be delivered: {0}")]
    FlushFailed(#[source] SyncError),

    #[error(transparent)]
    Api(#[from] SyncError),
}

impl SessionError {
    /// The user may press submit again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::FlushFailed(_) => true,
            SessionError::Api(err) => !err.is_terminal(),
            _ => false,
        }
    }
}
