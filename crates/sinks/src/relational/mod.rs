//! Relational sink: one table per tree node, keyed rows, FK references.

use crate::ddl::{DdlStatement, LiveColumn};
use async_trait::async_trait;
use schema_sensing::TableNamingContext;
use schemaforge_core::SinkResult;

mod service;
mod sqlite;
pub mod writer;

pub use service::RelationalService;
pub use sqlite::SqliteRelationalClient;
pub use writer::{RowWrite, plan_rows};

/// Naming-context table of an object type.
pub fn naming_table(object_type: &str) -> String {
    format!("{object_type}_SchemaTable")
}

/// Database surface used by [`RelationalService`].
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Columns of `table`; [`SinkError::NotFound`](schemaforge_core::SinkError::NotFound)
    /// if the table does not exist.
    async fn live_columns(&self, table: &str) -> SinkResult<Vec<LiveColumn>>;

    /// Run all statements in one transaction.
    async fn execute_ddl(&self, statements: &[DdlStatement]) -> SinkResult<()>;

    /// Insert each row unless its primary key is present, in one
    /// transaction. Returns how many rows were inserted.
    async fn write_rows(&self, rows: &[RowWrite]) -> SinkResult<usize>;

    /// Full path to index mapping for `object_type`; empty if none stored.
    async fn load_naming_context(
        &self,
        object_type: &str,
    ) -> SinkResult<TableNamingContext>;

    /// Append newly allocated path to index pairs.
    async fn append_naming_context(
        &self,
        object_type: &str,
        entries: &[(String, usize)],
    ) -> SinkResult<()>;
}
