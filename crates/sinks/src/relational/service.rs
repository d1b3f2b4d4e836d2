use super::{RelationalClient, plan_rows};
use crate::ddl::DdlSynchronizer;
use async_trait::async_trait;
use common::watchdog;
use schema_registry::{Migration, MigrationTrigger, SchemaCoordinator};
use schema_sensing::{
    KeyDescriptor, TableDescriptor, TableNamingContext, infer_tree,
    resolve_table_names,
};
use schemaforge_core::{IngestResult, Record, SinkKind, SinkService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Relational sink: converges the table tree for each record, then writes
/// all of its rows in one transaction.
pub struct RelationalService {
    client: Arc<dyn RelationalClient>,
    coordinator: SchemaCoordinator,
    ddl: DdlSynchronizer,
    op_timeout: Duration,
}

impl RelationalService {
    pub fn new(
        client: Arc<dyn RelationalClient>,
        coordinator: SchemaCoordinator,
        op_timeout: Duration,
    ) -> Self {
        Self {
            ddl: DdlSynchronizer::new(client.clone(), op_timeout),
            client,
            coordinator,
            op_timeout,
        }
    }

    pub fn coordinator(&self) -> &SchemaCoordinator {
        &self.coordinator
    }

    async fn naming_context(
        &self,
        object_type: &str,
        cancel: &CancellationToken,
    ) -> IngestResult<TableNamingContext> {
        Ok(watchdog(
            self.client.load_naming_context(object_type),
            self.op_timeout,
            cancel,
            "load naming context",
        )
        .await?)
    }

    /// Runs under the lease: allocate names, persist them, then apply DDL.
    async fn migrate(
        &self,
        raw: &TableDescriptor,
        object_type: &str,
        cancel: &CancellationToken,
    ) -> IngestResult<TableDescriptor> {
        let mut ctx = self.naming_context(object_type, cancel).await?;
        let mut tree = raw.clone();
        resolve_table_names(&mut tree, &mut ctx)?;

        if !ctx.allocated().is_empty() {
            watchdog(
                self.client
                    .append_naming_context(object_type, ctx.allocated()),
                self.op_timeout,
                cancel,
                "append naming context",
            )
            .await?;
            debug!(object_type, new_tables = ctx.allocated().len(), "table names allocated");
        }

        let plan = self.ddl.plan(&mut tree, cancel).await?;
        if self.ddl.apply(&plan, cancel).await? {
            info!(object_type, statements = plan.len(), "relational schema migrated");
        }
        Ok(tree)
    }
}

#[async_trait]
impl SinkService for RelationalService {
    type Prepared = TableDescriptor;

    fn kind(&self) -> SinkKind {
        SinkKind::Relational
    }

    async fn check_and_migrate(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> IngestResult<TableDescriptor> {
        let object_type = record.object_type.as_str();
        let version = record.data_version.as_str();
        let raw = infer_tree(object_type, &record.document_value())?;

        loop {
            let mut ctx = self.naming_context(object_type, cancel).await?;
            let mut tree = raw.clone();
            resolve_table_names(&mut tree, &mut ctx)?;

            let check = self
                .coordinator
                .check_schema(object_type, version, cancel)
                .await?;
            let trigger = if check.is_update_required() {
                MigrationTrigger::Version
            } else if !ctx.allocated().is_empty() {
                MigrationTrigger::Shape
            } else {
                // dry run: a non-empty diff means the sink is behind
                let plan = self.ddl.plan(&mut tree, cancel).await?;
                if plan.is_empty() {
                    return Ok(tree);
                }
                MigrationTrigger::Shape
            };

            let migration = self
                .coordinator
                .ensure_migrated(object_type, version, trigger, cancel, || {
                    self.migrate(&raw, object_type, cancel)
                })
                .await?;
            match migration {
                Migration::Performed(tree) => return Ok(tree),
                // names and columns may have changed; resolve again
                Migration::Adopted => continue,
            }
        }
    }

    async fn write(
        &self,
        record: &Record,
        tree: TableDescriptor,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let keys = KeyDescriptor::root(record.object_key.as_str());
        let rows = plan_rows(&record.document_value(), &tree, &keys)?;
        let inserted = watchdog(
            self.client.write_rows(&rows),
            self.op_timeout,
            cancel,
            "write rows",
        )
        .await?;
        debug!(
            object_type = %record.object_type,
            object_key = %record.object_key,
            rows = rows.len(),
            inserted,
            "relational rows written"
        );
        Ok(())
    }
}
