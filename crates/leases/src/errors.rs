use common::RetryOutcome;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lease marker for `{resource}` does not exist")]
    MarkerNotFound { resource: String },

    #[error("lease on `{resource}` is no longer held by this instance")]
    LeaseLost { resource: String },

    #[error("lock wait cancelled")]
    Cancelled,

    #[error("lease store call timed out: {action}")]
    Timeout { action: String },

    #[error("lease store error: {0}")]
    Database(String),

    #[error("lease metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

impl From<RetryOutcome<LockError>> for LockError {
    fn from(outcome: RetryOutcome<LockError>) -> Self {
        match outcome {
            RetryOutcome::Cancelled => LockError::Cancelled,
            RetryOutcome::Timeout { action } => LockError::Timeout {
                action: action.into_owned(),
            },
            RetryOutcome::Failed(e) => e,
        }
    }
}
