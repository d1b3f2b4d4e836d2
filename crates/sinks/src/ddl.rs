//! Additive schema diffs and the DDL that applies them.
//!
//! Live columns are never dropped or retyped. A desired column that exists
//! live under different casing is renamed to the live spelling instead of
//! being added twice.

use crate::relational::RelationalClient;
use common::{RetryOutcome, watchdog};
use schema_sensing::{ColumnDescriptor, FK_COLUMN, TableDescriptor};
use schemaforge_core::IngestResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A column as the sink reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub native_type: String,
}

impl LiveColumn {
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            native_type: native_type.into(),
        }
    }
}

/// Live columns per table name. A missing or empty entry means the table
/// does not exist yet.
pub type LiveSchema = HashMap<String, Vec<LiveColumn>>;

/// Columns of `desired` missing from `live`, compared ignoring case, in
/// desired order. Columns present live are renamed in `desired` to the live
/// spelling.
pub fn diff_columns(
    live: &[LiveColumn],
    desired: &mut TableDescriptor,
) -> Vec<ColumnDescriptor> {
    let mut missing = Vec::new();
    for column in &mut desired.columns {
        match live
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(&column.name))
        {
            Some(l) if l.name != column.name => column.name.clone_from(&l.name),
            Some(_) => {}
            None => missing.push(column.clone()),
        }
    }
    missing
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    CreateTable {
        table: String,
        columns: Vec<ColumnDescriptor>,
        primary_key: String,
        foreign_key: Option<ForeignKey>,
    },
    AddColumns {
        table: String,
        columns: Vec<ColumnDescriptor>,
    },
}

impl DdlStatement {
    pub fn table(&self) -> &str {
        match self {
            DdlStatement::CreateTable { table, .. }
            | DdlStatement::AddColumns { table, .. } => table,
        }
    }
}

/// Statements that bring a sink up to a tree, parents before children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DdlPlan {
    pub statements: Vec<DdlStatement>,
}

impl DdlPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }
}

/// Plan the DDL for `tree` against `live`, renaming columns in `tree` to
/// their live casing along the way. Empty tables are skipped.
pub fn plan_tree(tree: &mut TableDescriptor, live: &LiveSchema) -> DdlPlan {
    let mut plan = DdlPlan::default();
    plan_table(tree, None, live, &mut plan.statements);
    plan
}

fn plan_table(
    table: &mut TableDescriptor,
    parent: Option<&str>,
    live: &LiveSchema,
    out: &mut Vec<DdlStatement>,
) {
    if table.is_empty() {
        return;
    }

    match live.get(&table.table_name).filter(|cols| !cols.is_empty()) {
        None => out.push(create_table(table, parent)),
        Some(cols) => {
            let missing = diff_columns(cols, table);
            if !missing.is_empty() {
                out.push(DdlStatement::AddColumns {
                    table: table.table_name.clone(),
                    columns: missing,
                });
            }
        }
    }

    let name = table.table_name.clone();
    for child in &mut table.children {
        plan_table(child, Some(&name), live, out);
    }
}

fn create_table(table: &TableDescriptor, parent: Option<&str>) -> DdlStatement {
    let foreign_key = parent.zip(table.parent_key_column()).map(
        |(parent_table, parent_column)| ForeignKey {
            column: FK_COLUMN.to_owned(),
            parent_table: parent_table.to_owned(),
            parent_column: parent_column.to_owned(),
        },
    );
    DdlStatement::CreateTable {
        table: table.table_name.clone(),
        columns: table.columns.clone(),
        primary_key: table.primary_key_column().to_owned(),
        foreign_key,
    }
}

/// Reads live schema from a relational sink and applies plans to it.
#[derive(Clone)]
pub struct DdlSynchronizer {
    client: Arc<dyn RelationalClient>,
    op_timeout: Duration,
}

impl DdlSynchronizer {
    pub fn new(client: Arc<dyn RelationalClient>, op_timeout: Duration) -> Self {
        Self { client, op_timeout }
    }

    /// Live columns of every non-empty table in `tree`. Tables the sink
    /// does not know yet map to no columns.
    pub async fn live_schema(
        &self,
        tree: &TableDescriptor,
        cancel: &CancellationToken,
    ) -> IngestResult<LiveSchema> {
        let mut live = LiveSchema::new();
        for table in tree.tables() {
            if table.is_empty() {
                continue;
            }
            let columns = match watchdog(
                self.client.live_columns(&table.table_name),
                self.op_timeout,
                cancel,
                "read live columns",
            )
            .await
            {
                Ok(columns) => columns,
                Err(RetryOutcome::Failed(e)) if e.is_not_found() => Vec::new(),
                Err(outcome) => return Err(outcome.into()),
            };
            live.insert(table.table_name.clone(), columns);
        }
        Ok(live)
    }

    /// Diff `tree` against the sink. Also the relational dry run: a
    /// non-empty plan means the sink is behind the record.
    pub async fn plan(
        &self,
        tree: &mut TableDescriptor,
        cancel: &CancellationToken,
    ) -> IngestResult<DdlPlan> {
        let live = self.live_schema(tree, cancel).await?;
        let plan = plan_tree(tree, &live);
        debug!(table = %tree.table_name, statements = plan.len(), "ddl planned");
        Ok(plan)
    }

    /// Run `plan` in one transaction. Returns whether any DDL was needed.
    pub async fn apply(
        &self,
        plan: &DdlPlan,
        cancel: &CancellationToken,
    ) -> IngestResult<bool> {
        if plan.is_empty() {
            return Ok(false);
        }
        watchdog(
            self.client.execute_ddl(&plan.statements),
            self.op_timeout,
            cancel,
            "execute ddl",
        )
        .await?;
        for statement in &plan.statements {
            info!(table = statement.table(), ?statement, "ddl applied");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use schema_sensing::{
        ColumnType, TableNamingContext, infer_tree, resolve_table_names,
    };
    use serde_json::json;

    fn resolved(payload: serde_json::Value) -> TableDescriptor {
        let mut tree = infer_tree("T", &payload).unwrap();
        resolve_table_names(&mut tree, &mut TableNamingContext::default())
            .unwrap();
        tree
    }

    fn names(columns: &[ColumnDescriptor]) -> Vec<&str> {
        columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn diff_is_additive_and_adopts_live_casing() {
        let mut desired = resolved(json!({"objectKey": "k", "Amount": "1", "note": "x"}));
        let live = vec![
            LiveColumn::new("objectKey", "TEXT"),
            LiveColumn::new("amount", "TEXT"),
            LiveColumn::new("legacy", "INTEGER"),
        ];

        let missing = diff_columns(&live, &mut desired);

        assert_eq!(names(&missing), vec!["note"]);
        assert_eq!(names(&desired.columns), vec!["objectKey", "amount", "note"]);
    }

    #[test]
    fn first_sighting_creates_root_table() {
        let mut tree = resolved(json!({"objectKey": "k1", "a": "x"}));
        let plan = plan_tree(&mut tree, &LiveSchema::new());

        assert_eq!(
            plan.statements,
            vec![DdlStatement::CreateTable {
                table: "T".into(),
                columns: vec![
                    ColumnDescriptor::data("objectKey", ColumnType::Key),
                    ColumnDescriptor::data("a", ColumnType::String),
                ],
                primary_key: "objectKey".into(),
                foreign_key: None,
            }]
        );
    }

    #[test]
    fn matching_live_schema_needs_no_ddl() {
        let mut tree = resolved(json!({"objectKey": "k1", "a": "x"}));
        let live = LiveSchema::from([(
            "T".to_owned(),
            vec![LiveColumn::new("objectKey", "TEXT"), LiveColumn::new("A", "TEXT")],
        )]);

        assert!(plan_tree(&mut tree, &live).is_empty());
        assert_eq!(tree.column("a").unwrap().name, "A");
    }

    #[test]
    fn children_reference_their_parent_and_follow_it() {
        let mut tree = resolved(json!({
            "objectKey": "k1",
            "items": [{"sku": "A", "tags": [{"t": "x"}]}]
        }));
        let live = LiveSchema::from([(
            "T".to_owned(),
            vec![LiveColumn::new("objectKey", "TEXT")],
        )]);

        let plan = plan_tree(&mut tree, &live);
        let tables: Vec<&str> = plan.statements.iter().map(DdlStatement::table).collect();
        assert_eq!(tables, vec!["T0", "T1"]);

        let DdlStatement::CreateTable { columns, primary_key, foreign_key, .. } =
            &plan.statements[0]
        else {
            panic!("expected create");
        };
        assert_eq!(names(columns), vec!["PK", "FK", "sku"]);
        assert_eq!(primary_key, "PK");
        assert_eq!(
            foreign_key.as_ref().unwrap(),
            &ForeignKey {
                column: "FK".into(),
                parent_table: "T".into(),
                parent_column: "objectKey".into(),
            }
        );

        let DdlStatement::CreateTable { foreign_key, .. } = &plan.statements[1] else {
            panic!("expected create");
        };
        assert_eq!(foreign_key.as_ref().unwrap().parent_table, "T0");
        assert_eq!(foreign_key.as_ref().unwrap().parent_column, "PK");
    }

    #[test]
    fn new_columns_on_existing_table_are_added() {
        let mut tree = resolved(json!({"objectKey": "k1", "a": "x", "b": "y"}));
        let live = LiveSchema::from([(
            "T".to_owned(),
            vec![LiveColumn::new("objectKey", "TEXT"), LiveColumn::new("a", "TEXT")],
        )]);

        let plan = plan_tree(&mut tree, &live);
        assert_eq!(
            plan.statements,
            vec![DdlStatement::AddColumns {
                table: "T".into(),
                columns: vec![ColumnDescriptor::data("b", ColumnType::String)],
            }]
        );
    }
}
