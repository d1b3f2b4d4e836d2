//! Columnar analytics sink.
//!
//! One table per object type holding the flattened record. Migrations
//! create-merge the table and recreate the `{T}JSONMapping` ingestion
//! mapping. Direct ingestion falls back to the queued path when the store
//! throttles.

use crate::columnar::{flat_table, merged_columns, native_type};
use crate::ddl::{LiveColumn, diff_columns};
use async_trait::async_trait;
use common::{RetryOutcome, watchdog};
use parking_lot::Mutex;
use schema_registry::{MigrationTrigger, SchemaCoordinator};
use schema_sensing::ColumnDescriptor;
use schemaforge_core::{
    IngestResult, Record, SinkError, SinkKind, SinkResult, SinkService,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn mapping_name(table: &str) -> String {
    format!("{table}JSONMapping")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingColumn {
    pub column: String,
    pub path: String,
    pub datatype: String,
}

/// JSON ingestion mapping: one `$.{column}` path per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonMapping {
    pub name: String,
    pub columns: Vec<MappingColumn>,
}

impl JsonMapping {
    pub fn for_columns(table: &str, columns: &[ColumnDescriptor]) -> Self {
        Self {
            name: mapping_name(table),
            columns: columns
                .iter()
                .map(|c| MappingColumn {
                    column: c.name.clone(),
                    path: format!("$.{}", c.name),
                    datatype: native_type(c.column_type).to_owned(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Streaming ingestion, visible immediately.
    Direct,
    /// Batched through the store's queue.
    Queued,
}

#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    /// [`SinkError::NotFound`] if the table does not exist.
    async fn live_columns(&self, table: &str) -> SinkResult<Vec<LiveColumn>>;

    /// Create the table, or add the columns it lacks.
    async fn create_merge_table(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> SinkResult<()>;

    async fn create_or_alter_mapping(
        &self,
        table: &str,
        mapping: &JsonMapping,
    ) -> SinkResult<()>;

    async fn ingest(
        &self,
        table: &str,
        mapping: &str,
        rows: &[Map<String, Value>],
        mode: IngestMode,
    ) -> SinkResult<()>;
}

pub struct AnalyticsService {
    client: Arc<dyn AnalyticsClient>,
    coordinator: SchemaCoordinator,
    op_timeout: Duration,
}

impl AnalyticsService {
    pub fn new(
        client: Arc<dyn AnalyticsClient>,
        coordinator: SchemaCoordinator,
        op_timeout: Duration,
    ) -> Self {
        Self {
            client,
            coordinator,
            op_timeout,
        }
    }

    async fn migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let table = record.object_type.as_str();
        let live = match watchdog(
            self.client.live_columns(table),
            self.op_timeout,
            cancel,
            "read analytics columns",
        )
        .await
        {
            Ok(live) => live,
            Err(RetryOutcome::Failed(e)) if e.is_not_found() => Vec::new(),
            Err(outcome) => return Err(outcome.into()),
        };

        let mut desired = flat_table(table, record, &[]);
        let missing = diff_columns(&live, &mut desired);
        if live.is_empty() || !missing.is_empty() {
            watchdog(
                self.client.create_merge_table(table, &desired.columns),
                self.op_timeout,
                cancel,
                "create-merge table",
            )
            .await?;
        }

        let mapping = JsonMapping::for_columns(table, &merged_columns(&live, &missing));
        watchdog(
            self.client.create_or_alter_mapping(table, &mapping),
            self.op_timeout,
            cancel,
            "create mapping",
        )
        .await?;

        info!(
            table,
            added = missing.len(),
            mapping = %mapping.name,
            "analytics schema migrated"
        );
        Ok(())
    }
}

#[async_trait]
impl SinkService for AnalyticsService {
    type Prepared = ();

    fn kind(&self) -> SinkKind {
        SinkKind::Analytics
    }

    async fn check_and_migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let check = self
            .coordinator
            .check_schema(&record.object_type, &record.data_version, cancel)
            .await?;
        if !check.is_update_required() {
            return Ok(());
        }

        self.coordinator
            .ensure_migrated(
                &record.object_type,
                &record.data_version,
                MigrationTrigger::Version,
                cancel,
                || self.migrate(record, cancel),
            )
            .await?;
        Ok(())
    }

    async fn write(
        &self,
        record: &Record,
        _prepared: (),
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let table = record.object_type.as_str();
        let mapping = mapping_name(table);
        let rows = [record.flattened()];

        let direct = watchdog(
            self.client.ingest(table, &mapping, &rows, IngestMode::Direct),
            self.op_timeout,
            cancel,
            "direct ingest",
        )
        .await;
        match direct {
            Ok(()) => {
                debug!(table, object_key = %record.object_key, "analytics row ingested");
                Ok(())
            }
            Err(RetryOutcome::Failed(e)) if e.is_throttled() => {
                warn!(table, error = %e, "direct ingest throttled, using queued ingest");
                watchdog(
                    self.client.ingest(table, &mapping, &rows, IngestMode::Queued),
                    self.op_timeout,
                    cancel,
                    "queued ingest",
                )
                .await?;
                Ok(())
            }
            Err(outcome) => Err(outcome.into()),
        }
    }
}

// ============================================================================
// In-memory client
// ============================================================================

#[derive(Debug, Default)]
struct MemAnalyticsState {
    tables: HashMap<String, Vec<LiveColumn>>,
    mappings: HashMap<String, JsonMapping>,
    direct: Vec<(String, Map<String, Value>)>,
    queued: Vec<(String, Map<String, Value>)>,
    throttle_direct: bool,
    create_merge_calls: usize,
}

/// Process-local analytics store for tests and local runs.
#[derive(Debug, Default)]
pub struct MemAnalyticsClient {
    state: Mutex<MemAnalyticsState>,
}

impl MemAnalyticsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make direct ingestion report throttling.
    pub fn set_throttled(&self, throttled: bool) {
        self.state.lock().throttle_direct = throttled;
    }

    pub fn mapping(&self, name: &str) -> Option<JsonMapping> {
        self.state.lock().mappings.get(name).cloned()
    }

    pub fn direct_rows(&self, table: &str) -> Vec<Map<String, Value>> {
        rows_for(&self.state.lock().direct, table)
    }

    pub fn queued_rows(&self, table: &str) -> Vec<Map<String, Value>> {
        rows_for(&self.state.lock().queued, table)
    }

    pub fn create_merge_calls(&self) -> usize {
        self.state.lock().create_merge_calls
    }
}

fn rows_for(
    rows: &[(String, Map<String, Value>)],
    table: &str,
) -> Vec<Map<String, Value>> {
    rows.iter()
        .filter(|(t, _)| t == table)
        .map(|(_, row)| row.clone())
        .collect()
}

#[async_trait]
impl AnalyticsClient for MemAnalyticsClient {
    async fn live_columns(&self, table: &str) -> SinkResult<Vec<LiveColumn>> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| SinkError::NotFound {
                details: format!("table {table}").into(),
            })
    }

    async fn create_merge_table(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> SinkResult<()> {
        let mut state = self.state.lock();
        state.create_merge_calls += 1;
        let live = state.tables.entry(table.to_owned()).or_default();
        for column in columns {
            if !live.iter().any(|l| l.name.eq_ignore_ascii_case(&column.name)) {
                live.push(LiveColumn::new(
                    column.name.as_str(),
                    native_type(column.column_type),
                ));
            }
        }
        Ok(())
    }

    async fn create_or_alter_mapping(
        &self,
        table: &str,
        mapping: &JsonMapping,
    ) -> SinkResult<()> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(table) {
            return Err(SinkError::NotFound {
                details: format!("table {table}").into(),
            });
        }
        state.mappings.insert(mapping.name.clone(), mapping.clone());
        Ok(())
    }

    async fn ingest(
        &self,
        table: &str,
        mapping: &str,
        rows: &[Map<String, Value>],
        mode: IngestMode,
    ) -> SinkResult<()> {
        let mut state = self.state.lock();
        if mode == IngestMode::Direct && state.throttle_direct {
            return Err(SinkError::Throttled {
                details: "429 too many requests".into(),
            });
        }
        if !state.mappings.contains_key(mapping) {
            return Err(SinkError::NotFound {
                details: format!("mapping {mapping}").into(),
            });
        }
        let target = match mode {
            IngestMode::Direct => &mut state.direct,
            IngestMode::Queued => &mut state.queued,
        };
        target.extend(rows.iter().map(|row| (table.to_owned(), row.clone())));
        Ok(())
    }
}
