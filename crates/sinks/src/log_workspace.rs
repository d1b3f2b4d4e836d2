//! Log-workspace sink.
//!
//! Records land in the custom table `{T}_CL` through the stream
//! `Custom-{T}_CL` of ingestion rule `{T}DCR`. Uploads address a rule by
//! its immutable id, which changes whenever the rule is recreated, so ids
//! are cached per object type and refreshed after a peer migrated.

use crate::columnar::{flat_table, merged_columns, native_type};
use crate::ddl::{LiveColumn, diff_columns};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use common::{RetryOutcome, watchdog};
use parking_lot::{Mutex, RwLock};
use schema_registry::{Migration, MigrationTrigger, SchemaCoordinator};
use schema_sensing::{ColumnDescriptor, ColumnType};
use schemaforge_core::{
    IngestResult, Record, SinkError, SinkKind, SinkResult, SinkService,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TIME_GENERATED_COLUMN: &str = "TimeGenerated";

pub fn table_name(object_type: &str) -> String {
    format!("{object_type}_CL")
}

pub fn stream_name(object_type: &str) -> String {
    format!("Custom-{object_type}_CL")
}

pub fn rule_name(object_type: &str) -> String {
    format!("{object_type}DCR")
}

/// Ingestion rule routing one stream into one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRule {
    pub name: String,
    pub stream: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl IngestionRule {
    pub fn for_object_type(object_type: &str, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: rule_name(object_type),
            stream: stream_name(object_type),
            table: table_name(object_type),
            columns,
        }
    }
}

#[async_trait]
pub trait LogWorkspaceClient: Send + Sync {
    /// [`SinkError::NotFound`] if the table does not exist.
    async fn live_columns(&self, table: &str) -> SinkResult<Vec<LiveColumn>>;

    /// Create or replace the table schema with exactly `columns`.
    async fn put_table(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> SinkResult<()>;

    /// Delete and recreate the rule so schema changes apply immediately.
    /// Returns the new immutable id.
    async fn recreate_ingestion_rule(
        &self,
        rule: &IngestionRule,
    ) -> SinkResult<String>;

    async fn ingestion_rule_id(&self, rule: &str) -> SinkResult<Option<String>>;

    async fn upload(
        &self,
        rule_id: &str,
        stream: &str,
        rows: &[Map<String, Value>],
    ) -> SinkResult<()>;
}

/// A rule id and the synced version it was read or created at.
#[derive(Debug, Clone)]
struct CachedRule {
    version: Option<String>,
    id: String,
}

pub struct LogWorkspaceService {
    client: Arc<dyn LogWorkspaceClient>,
    coordinator: SchemaCoordinator,
    rule_ids: RwLock<HashMap<String, CachedRule>>,
    op_timeout: Duration,
}

impl LogWorkspaceService {
    pub fn new(
        client: Arc<dyn LogWorkspaceClient>,
        coordinator: SchemaCoordinator,
        op_timeout: Duration,
    ) -> Self {
        Self {
            client,
            coordinator,
            rule_ids: RwLock::new(HashMap::new()),
            op_timeout,
        }
    }

    /// Cached rule id, unless the synced version moved since it was cached.
    pub fn cached_rule_id(&self, object_type: &str) -> Option<String> {
        let synced = self.coordinator.cached_version(object_type);
        self.rule_ids
            .read()
            .get(object_type)
            .filter(|rule| rule.version == synced)
            .map(|rule| rule.id.clone())
    }

    fn cache_rule_id(&self, object_type: &str, id: &str) {
        let rule = CachedRule {
            version: self.coordinator.cached_version(object_type),
            id: id.to_owned(),
        };
        self.rule_ids.write().insert(object_type.to_owned(), rule);
    }

    async fn migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<String> {
        let object_type = record.object_type.as_str();
        let table = table_name(object_type);
        let live = match watchdog(
            self.client.live_columns(&table),
            self.op_timeout,
            cancel,
            "read workspace columns",
        )
        .await
        {
            Ok(live) => live,
            Err(RetryOutcome::Failed(e)) if e.is_not_found() => Vec::new(),
            Err(outcome) => return Err(outcome.into()),
        };

        let time_generated =
            ColumnDescriptor::data(TIME_GENERATED_COLUMN, ColumnType::DateTime);
        let mut desired = flat_table(&table, record, &[time_generated]);
        let missing = diff_columns(&live, &mut desired);
        let columns = merged_columns(&live, &missing);

        if !missing.is_empty() {
            watchdog(
                self.client.put_table(&table, &columns),
                self.op_timeout,
                cancel,
                "put workspace table",
            )
            .await?;
        }

        let rule = IngestionRule::for_object_type(object_type, columns);
        let id = watchdog(
            self.client.recreate_ingestion_rule(&rule),
            self.op_timeout,
            cancel,
            "recreate ingestion rule",
        )
        .await?;

        info!(
            %table,
            rule = %rule.name,
            rule_id = %id,
            added = missing.len(),
            "log workspace schema migrated"
        );
        Ok(id)
    }

    async fn refresh_rule_id(
        &self,
        object_type: &str,
        cancel: &CancellationToken,
    ) -> IngestResult<Option<String>> {
        let id = watchdog(
            self.client.ingestion_rule_id(&rule_name(object_type)),
            self.op_timeout,
            cancel,
            "read ingestion rule",
        )
        .await?;
        if let Some(id) = &id {
            self.cache_rule_id(object_type, id);
        }
        Ok(id)
    }
}

#[async_trait]
impl SinkService for LogWorkspaceService {
    /// Immutable id of the rule to upload through.
    type Prepared = String;

    fn kind(&self) -> SinkKind {
        SinkKind::LogWorkspace
    }

    async fn check_and_migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<String> {
        let object_type = record.object_type.as_str();
        let version = record.data_version.as_str();

        let check = self
            .coordinator
            .check_schema(object_type, version, cancel)
            .await?;
        if check.is_update_required() {
            let migration = self
                .coordinator
                .ensure_migrated(object_type, version, MigrationTrigger::Version, cancel, || {
                    self.migrate(record, cancel)
                })
                .await?;
            match migration {
                Migration::Performed(id) => {
                    self.cache_rule_id(object_type, &id);
                    return Ok(id);
                }
                // the peer recreated the rule under a new id
                Migration::Adopted => {
                    if let Some(id) = self.refresh_rule_id(object_type, cancel).await? {
                        return Ok(id);
                    }
                }
            }
        } else if let Some(id) = self.cached_rule_id(object_type) {
            return Ok(id);
        } else if let Some(id) = self.refresh_rule_id(object_type, cancel).await? {
            return Ok(id);
        }

        // version is synced but the rule is gone
        warn!(object_type, "ingestion rule missing, recreating");
        let migration = self
            .coordinator
            .ensure_migrated(object_type, version, MigrationTrigger::Shape, cancel, || {
                self.migrate(record, cancel)
            })
            .await?;
        let id = match migration {
            Migration::Performed(id) => id,
            Migration::Adopted => self
                .refresh_rule_id(object_type, cancel)
                .await?
                .ok_or_else(|| SinkError::NotFound {
                    details: format!("ingestion rule {}", rule_name(object_type)).into(),
                })?,
        };
        self.cache_rule_id(object_type, &id);
        Ok(id)
    }

    async fn write(
        &self,
        record: &Record,
        rule_id: String,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let object_type = record.object_type.as_str();
        let mut row = Map::new();
        row.insert(
            TIME_GENERATED_COLUMN.to_owned(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row.extend(record.flattened());

        match watchdog(
            self.client.upload(&rule_id, &stream_name(object_type), &[row]),
            self.op_timeout,
            cancel,
            "upload",
        )
        .await
        {
            Ok(()) => {
                debug!(object_type, object_key = %record.object_key, "log workspace row uploaded");
                Ok(())
            }
            Err(RetryOutcome::Failed(e)) if e.is_not_found() => {
                // stale id after a peer recreated the rule; the redelivery
                // looks it up again
                self.rule_ids.write().remove(object_type);
                Err(e.into())
            }
            Err(outcome) => Err(outcome.into()),
        }
    }
}

// ============================================================================
// In-memory client
// ============================================================================

#[derive(Debug, Default)]
struct MemWorkspaceState {
    tables: HashMap<String, Vec<LiveColumn>>,
    rules: HashMap<String, (String, IngestionRule)>,
    uploads: Vec<(String, Map<String, Value>)>,
    next_rule: usize,
}

/// Process-local log workspace for tests and local runs.
#[derive(Debug, Default)]
pub struct MemLogWorkspaceClient {
    state: Mutex<MemWorkspaceState>,
}

impl MemLogWorkspaceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(&self, name: &str) -> Option<(String, IngestionRule)> {
        self.state.lock().rules.get(name).cloned()
    }

    /// Rows uploaded through `stream`.
    pub fn uploads(&self, stream: &str) -> Vec<Map<String, Value>> {
        self.state
            .lock()
            .uploads
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn delete_rule(&self, name: &str) {
        self.state.lock().rules.remove(name);
    }
}

#[async_trait]
impl LogWorkspaceClient for MemLogWorkspaceClient {
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

    async fn put_table(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> SinkResult<()> {
        let live = columns
            .iter()
            .map(|c| LiveColumn::new(c.name.as_str(), native_type(c.column_type)))
            .collect();
        self.state.lock().tables.insert(table.to_owned(), live);
        Ok(())
    }

    async fn recreate_ingestion_rule(
        &self,
        rule: &IngestionRule,
    ) -> SinkResult<String> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(&rule.table) {
            return Err(SinkError::NotFound {
                details: format!("table {}", rule.table).into(),
            });
        }
        state.next_rule += 1;
        let id = format!("dcr-{:04}", state.next_rule);
        state
            .rules
            .insert(rule.name.clone(), (id.clone(), rule.clone()));
        Ok(id)
    }

    async fn ingestion_rule_id(&self, rule: &str) -> SinkResult<Option<String>> {
        Ok(self.state.lock().rules.get(rule).map(|(id, _)| id.clone()))
    }

    async fn upload(
        &self,
        rule_id: &str,
        stream: &str,
        rows: &[Map<String, Value>],
    ) -> SinkResult<()> {
        let mut state = self.state.lock();
        let known = state
            .rules
            .values()
            .any(|(id, rule)| id == rule_id && rule.stream == stream);
        if !known {
            return Err(SinkError::NotFound {
                details: format!("rule {rule_id} with stream {stream}").into(),
            });
        }
        state
            .uploads
            .extend(rows.iter().map(|row| (stream.to_owned(), row.clone())));
        Ok(())
    }
}
