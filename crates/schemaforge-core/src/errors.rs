use common::RetryOutcome;
use leases::LockError;
use schema_sensing::SchemaError;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection error: {details}")]
    Connect { details: Cow<'static, str> },

    /// The store asked us to slow down; callers may fall back to a
    /// queued write path.
    #[error("throttled: {details}")]
    Throttled { details: Cow<'static, str> },

    #[error("resource not found: {details}")]
    NotFound { details: Cow<'static, str> },

    #[error("ddl failed: {details}")]
    Ddl { details: Cow<'static, str> },

    #[error("write failed: {details}")]
    Write { details: Cow<'static, str> },

    #[error("timeout during {action}")]
    Timeout { action: Cow<'static, str> },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SinkError {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Connect { .. } => "connect error",
            SinkError::Throttled { .. } => "throttled",
            SinkError::NotFound { .. } => "not found",
            SinkError::Ddl { .. } => "ddl error",
            SinkError::Write { .. } => "write error",
            SinkError::Timeout { .. } => "timeout",
            SinkError::Serialization(_) => "serialization error",
            SinkError::Other(_) => "other error",
        }
    }

    pub fn details(&self) -> String {
        match self {
            SinkError::Connect { details }
            | SinkError::Throttled { details }
            | SinkError::NotFound { details }
            | SinkError::Ddl { details }
            | SinkError::Write { details } => details.to_string(),
            SinkError::Timeout { action } => action.to_string(),
            SinkError::Serialization(e) => e.to_string(),
            SinkError::Other(e) => e.to_string(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, SinkError::Throttled { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SinkError::NotFound { .. })
    }
}

/// Everything that can go wrong ingesting one record into one sink.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {details}")]
    Payload { details: Cow<'static, str> },

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Payload { .. } => "payload error",
            IngestError::Schema(_) => "schema error",
            IngestError::Lock(_) => "lock error",
            IngestError::Sink(e) => e.kind(),
            IngestError::Cancelled => "cancelled",
            IngestError::Other(_) => "other error",
        }
    }

    /// Shutdown in progress; the message must stay unacknowledged.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            IngestError::Cancelled | IngestError::Lock(LockError::Cancelled)
        )
    }

    /// The payload itself is malformed; redelivery cannot help.
    pub fn is_structural(&self) -> bool {
        matches!(self, IngestError::Payload { .. } | IngestError::Schema(_))
    }
}

impl From<RetryOutcome<SinkError>> for IngestError {
    fn from(outcome: RetryOutcome<SinkError>) -> Self {
        match outcome {
            RetryOutcome::Cancelled => IngestError::Cancelled,
            RetryOutcome::Timeout { action } => {
                IngestError::Sink(SinkError::Timeout { action })
            }
            RetryOutcome::Failed(e) => IngestError::Sink(e),
        }
    }
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;
pub type IngestResult<T> = std::result::Result<T, IngestError>;
