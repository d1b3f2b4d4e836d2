//! Sink services for SchemaForge.
//!
//! Every sink converges its schema to the incoming record under the
//! version/lease protocol of [`schema_registry::SchemaCoordinator`], then
//! writes the record.
//!
//! # Available Sinks
//!
//! - **Relational**: one table per nested object or array, keyed rows,
//!   idempotent multi-table writes in one transaction
//! - **Analytics**: one flattened table per object type with a JSON
//!   ingestion mapping; throttled direct ingest falls back to queued
//! - **Log workspace**: custom `{T}_CL` tables fed through per-type
//!   ingestion rules
//!
//! Vendor clients for the analytics and log-workspace stores live outside
//! this crate behind [`AnalyticsClient`] and [`LogWorkspaceClient`].

use anyhow::Context;
use leases::LockService;
use schema_registry::{MemSchemaVersionCache, SchemaCoordinator};
use schemaforge_config::{Config, SinkCfg};
use schemaforge_core::{RecordIngestor, SinkKind};
use std::sync::Arc;
use tracing::info;

pub mod analytics;
mod columnar;
pub mod ddl;
pub mod log_workspace;
pub mod relational;

pub use analytics::{AnalyticsClient, AnalyticsService, MemAnalyticsClient};
pub use ddl::{DdlPlan, DdlStatement, DdlSynchronizer, LiveColumn, diff_columns, plan_tree};
pub use log_workspace::{LogWorkspaceClient, LogWorkspaceService, MemLogWorkspaceClient};
pub use relational::{
    RelationalClient, RelationalService, RowWrite, SqliteRelationalClient,
    plan_rows,
};

/// Clients for the stores this crate cannot open from config alone.
#[derive(Clone, Default)]
pub struct SinkAdapters {
    pub analytics: Option<Arc<dyn AnalyticsClient>>,
    pub log_workspace: Option<Arc<dyn LogWorkspaceClient>>,
}

/// A configured sink ready for a worker.
#[derive(Clone)]
pub struct SinkHandle {
    pub id: String,
    pub kind: SinkKind,
    pub ingestor: Arc<dyn RecordIngestor>,
}

fn coordinator(kind: SinkKind, locks: &LockService) -> SchemaCoordinator {
    SchemaCoordinator::new(kind, locks.clone(), Arc::new(MemSchemaVersionCache::new()))
}

/// Build one service per enabled sink. Disabled sinks are skipped.
pub fn build_services(
    cfg: &Config,
    locks: &LockService,
    adapters: &SinkAdapters,
) -> anyhow::Result<Vec<SinkHandle>> {
    let op_timeout = cfg.worker.op_timeout();
    cfg.enabled_sinks()
        .map(|sink| {
            let (kind, ingestor): (SinkKind, Arc<dyn RecordIngestor>) = match sink {
                SinkCfg::Relational(c) => {
                    let client = SqliteRelationalClient::open(&c.path)
                        .with_context(|| format!("open relational sink {}", c.id))?;
                    let kind = SinkKind::Relational;
                    (
                        kind,
                        Arc::new(RelationalService::new(
                            Arc::new(client),
                            coordinator(kind, locks),
                            op_timeout,
                        )),
                    )
                }
                SinkCfg::Analytics(c) => {
                    let client = adapters
                        .analytics
                        .clone()
                        .with_context(|| format!("no analytics client for sink {}", c.id))?;
                    let kind = SinkKind::Analytics;
                    (
                        kind,
                        Arc::new(AnalyticsService::new(
                            client,
                            coordinator(kind, locks),
                            op_timeout,
                        )),
                    )
                }
                SinkCfg::LogWorkspace(c) => {
                    let client = adapters.log_workspace.clone().with_context(|| {
                        format!("no log workspace client for sink {}", c.id)
                    })?;
                    let kind = SinkKind::LogWorkspace;
                    (
                        kind,
                        Arc::new(LogWorkspaceService::new(
                            client,
                            coordinator(kind, locks),
                            op_timeout,
                        )),
                    )
                }
            };
            info!(sink_id = sink.id(), %kind, "sink service built");
            Ok(SinkHandle {
                id: sink.id().to_owned(),
                kind,
                ingestor,
            })
        })
        .collect()
}
