use crate::errors::{IngestError, IngestResult};
use crate::record::{Record, is_delta_element};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sink families. The name is part of every lock resource id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Analytics,
    LogWorkspace,
    Relational,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Analytics => "analytics",
            SinkKind::LogWorkspace => "logworkspace",
            SinkKind::Relational => "relational",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sink's schema convergence and write path.
///
/// `check_and_migrate` brings the sink schema up to date for the record
/// and hands whatever the write needs (a resolved table tree, an
/// ingestion rule id) to `write`.
#[async_trait]
pub trait SinkService: Send + Sync {
    type Prepared: Send;

    fn kind(&self) -> SinkKind;

    async fn check_and_migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<Self::Prepared>;

    async fn write(
        &self,
        record: &Record,
        prepared: Self::Prepared,
        cancel: &CancellationToken,
    ) -> IngestResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Written,
    /// Delta records are acknowledged without touching the sink.
    Skipped,
}

/// Object-safe entry point used by workers: one JSON element in, one
/// outcome out.
#[async_trait]
pub trait RecordIngestor: Send + Sync {
    fn sink(&self) -> SinkKind;

    async fn ingest_record(
        &self,
        element: &Value,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestOutcome>;
}

#[async_trait]
impl<S: SinkService> RecordIngestor for S {
    fn sink(&self) -> SinkKind {
        self.kind()
    }

    async fn ingest_record(
        &self,
        element: &Value,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestOutcome> {
        if is_delta_element(element) {
            debug!(sink = %self.kind(), "skipping delta record");
            return Ok(IngestOutcome::Skipped);
        }
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let record = Record::from_element(element)?;
        let prepared = self.check_and_migrate(&record, cancel).await?;
        self.write(&record, prepared, cancel).await?;

        debug!(
            sink = %self.kind(),
            object_type = %record.object_type,
            object_key = %record.object_key,
            "record written"
        );
        Ok(IngestOutcome::Written)
    }
}
