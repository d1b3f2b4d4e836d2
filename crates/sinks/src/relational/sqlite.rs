//! SQLite relational sink.
//!
//! All DB calls are dispatched via `tokio::task::spawn_blocking` on one
//! shared connection. Every semantic column type is stored as text.

use super::{RelationalClient, RowWrite, naming_table};
use crate::ddl::{DdlStatement, LiveColumn};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use schema_sensing::{ColumnDescriptor, ColumnType, TableNamingContext};
use schemaforge_core::{SinkError, SinkResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Spawn a blocking closure that receives a locked `&mut Connection`.
macro_rules! db {
    ($conn:expr, $body:expr) => {{
        let conn = Arc::clone(&$conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| SinkError::Connect {
                details: format!("connection mutex poisoned: {e}").into(),
            })?;
            ($body)(&mut *guard)
        })
        .await
        .map_err(|e| SinkError::Other(anyhow::anyhow!("spawn_blocking panic: {e}")))?
    }};
}

fn read_err(e: rusqlite::Error) -> SinkError {
    SinkError::Other(e.into())
}

fn ddl_err(e: rusqlite::Error) -> SinkError {
    SinkError::Ddl {
        details: e.to_string().into(),
    }
}

fn write_err(e: rusqlite::Error) -> SinkError {
    SinkError::Write {
        details: e.to_string().into(),
    }
}

pub struct SqliteRelationalClient {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRelationalClient {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| SinkError::Connect {
            details: format!("open {}: {e}", path.as_ref().display()).into(),
        })?;
        Self::init(conn)
    }

    pub fn in_memory() -> SinkResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SinkError::Connect {
            details: e.to_string().into(),
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SinkResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            PRAGMA foreign_keys=ON;
            "#,
        )
        .map_err(|e| SinkError::Connect {
            details: e.to_string().into(),
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn native_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String | ColumnType::Key => "TEXT",
        ColumnType::DateTime => "DATETIME",
    }
}

fn column_def(column: &ColumnDescriptor, primary_key: Option<&str>) -> String {
    let mut def = format!("{} {}", quote(&column.name), native_type(column.column_type));
    if primary_key.is_some_and(|pk| pk.eq_ignore_ascii_case(&column.name)) {
        def.push_str(" NOT NULL PRIMARY KEY");
    } else if column.is_schema_column {
        def.push_str(" NOT NULL");
    }
    def
}

/// SQL for one planned statement.
pub(crate) fn render(statement: &DdlStatement) -> Vec<String> {
    match statement {
        DdlStatement::CreateTable {
            table,
            columns,
            primary_key,
            foreign_key,
        } => {
            let mut defs: Vec<String> = columns
                .iter()
                .map(|c| column_def(c, Some(primary_key)))
                .collect();
            if let Some(fk) = foreign_key {
                defs.push(format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({})",
                    quote(&fk.column),
                    quote(&fk.parent_table),
                    quote(&fk.parent_column)
                ));
            }
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote(table),
                defs.join(", ")
            )]
        }
        // sqlite adds one column per ALTER
        DdlStatement::AddColumns { table, columns } => columns
            .iter()
            .map(|c| {
                format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote(table),
                    column_def(c, None)
                )
            })
            .collect(),
    }
}

fn insert_sql(row: &RowWrite) -> String {
    let columns: Vec<String> = row.columns.iter().map(|c| quote(c)).collect();
    let placeholders: Vec<String> =
        (1..=row.columns.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {table} ({columns}) SELECT {placeholders} \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {pk} = ?{key})",
        table = quote(&row.table),
        columns = columns.join(", "),
        placeholders = placeholders.join(", "),
        pk = quote(&row.primary_key_column),
        key = row.columns.len() + 1,
    )
}

#[async_trait]
impl RelationalClient for SqliteRelationalClient {
    async fn live_columns(&self, table: &str) -> SinkResult<Vec<LiveColumn>> {
        let table = table.to_owned();
        db!(self.conn, move |conn: &mut Connection| -> SinkResult<Vec<LiveColumn>> {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({})", quote(&table)))
                .map_err(read_err)?;
            let columns = stmt
                .query_map([], |row| {
                    Ok(LiveColumn::new(
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(read_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_err)?;
            if columns.is_empty() {
                return Err(SinkError::NotFound {
                    details: format!("table {table}").into(),
                });
            }
            Ok(columns)
        })
    }

    async fn execute_ddl(&self, statements: &[DdlStatement]) -> SinkResult<()> {
        let sql: Vec<String> = statements.iter().flat_map(render).collect();
        db!(self.conn, move |conn: &mut Connection| -> SinkResult<()> {
            let tx = conn.transaction().map_err(ddl_err)?;
            for statement in &sql {
                debug!(sql = %statement, "executing ddl");
                tx.execute_batch(statement).map_err(ddl_err)?;
            }
            tx.commit().map_err(ddl_err)
        })
    }

    async fn write_rows(&self, rows: &[RowWrite]) -> SinkResult<usize> {
        let rows = rows.to_vec();
        db!(self.conn, move |conn: &mut Connection| -> SinkResult<usize> {
            let tx = conn.transaction().map_err(write_err)?;
            let mut inserted = 0;
            for row in &rows {
                let Some(key) = row.primary_key() else {
                    return Err(SinkError::Write {
                        details: format!("row for {} has no primary key", row.table).into(),
                    });
                };
                let params = row
                    .values
                    .iter()
                    .map(Option::as_deref)
                    .chain(std::iter::once(Some(key)));
                inserted += tx
                    .execute(&insert_sql(row), params_from_iter(params))
                    .map_err(write_err)?;
            }
            // dropping an uncommitted transaction rolls it back
            tx.commit().map_err(write_err)?;
            Ok(inserted)
        })
    }

    async fn load_naming_context(
        &self,
        object_type: &str,
    ) -> SinkResult<TableNamingContext> {
        let table = naming_table(object_type);
        db!(self.conn, move |conn: &mut Connection| -> SinkResult<TableNamingContext> {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |_| Ok(()),
                )
                .optional()
                .map_err(read_err)?
                .is_some();
            if !exists {
                return Ok(TableNamingContext::default());
            }

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT \"Path\", \"TableIndex\" FROM {}",
                    quote(&table)
                ))
                .map_err(read_err)?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(read_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_err)?;

            let mut entries = Vec::with_capacity(raw.len());
            for (path, index) in raw {
                let index = usize::try_from(index).map_err(|_| {
                    SinkError::Other(anyhow::anyhow!(
                        "negative table index {index} for {path} in {table}"
                    ))
                })?;
                entries.push((path, index));
            }
            Ok(TableNamingContext::from_entries(entries))
        })
    }

    async fn append_naming_context(
        &self,
        object_type: &str,
        entries: &[(String, usize)],
    ) -> SinkResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let table = quote(&naming_table(object_type));
        let entries = entries.to_vec();
        db!(self.conn, move |conn: &mut Connection| -> SinkResult<()> {
            let tx = conn.transaction().map_err(ddl_err)?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 \"Path\" TEXT NOT NULL PRIMARY KEY, \
                 \"TableIndex\" INTEGER NOT NULL)"
            ))
            .map_err(ddl_err)?;
            for (path, index) in &entries {
                let index = i64::try_from(*index).map_err(|e| SinkError::Other(e.into()))?;
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {table} (\"Path\", \"TableIndex\") \
                         VALUES (?1, ?2)"
                    ),
                    params![path, index],
                )
                .map_err(write_err)?;
            }
            tx.commit().map_err(write_err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::ForeignKey;
    use pretty_assertions::assert_eq;

    fn create_orders() -> DdlStatement {
        DdlStatement::CreateTable {
            table: "Order".into(),
            columns: vec![
                ColumnDescriptor::data("objectKey", ColumnType::Key),
                ColumnDescriptor::data("amount", ColumnType::String),
            ],
            primary_key: "objectKey".into(),
            foreign_key: None,
        }
    }

    fn create_items() -> DdlStatement {
        DdlStatement::CreateTable {
            table: "Order0".into(),
            columns: vec![
                ColumnDescriptor::schema("PK"),
                ColumnDescriptor::schema("FK"),
                ColumnDescriptor::data("sku", ColumnType::String),
            ],
            primary_key: "PK".into(),
            foreign_key: Some(ForeignKey {
                column: "FK".into(),
                parent_table: "Order".into(),
                parent_column: "objectKey".into(),
            }),
        }
    }

    fn row(table: &str, pk: &str, cols: &[(&str, &str)]) -> RowWrite {
        RowWrite {
            table: table.into(),
            primary_key_column: pk.into(),
            columns: cols.iter().map(|(c, _)| c.to_string()).collect(),
            values: cols.iter().map(|(_, v)| Some(v.to_string())).collect(),
        }
    }

    #[test]
    fn renders_create_with_keys() {
        assert_eq!(
            render(&create_items()),
            vec![
                "CREATE TABLE IF NOT EXISTS \"Order0\" (\"PK\" TEXT NOT NULL PRIMARY KEY, \
                 \"FK\" TEXT NOT NULL, \"sku\" TEXT, \
                 FOREIGN KEY (\"FK\") REFERENCES \"Order\" (\"objectKey\"))"
                    .to_owned()
            ]
        );
    }

    #[test]
    fn renders_one_alter_per_column() {
        let sql = render(&DdlStatement::AddColumns {
            table: "T".into(),
            columns: vec![
                ColumnDescriptor::data("a", ColumnType::String),
                ColumnDescriptor::data("at", ColumnType::DateTime),
            ],
        });
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"T\" ADD COLUMN \"a\" TEXT".to_owned(),
                "ALTER TABLE \"T\" ADD COLUMN \"at\" DATETIME".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        let err = client.live_columns("Nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ddl_then_live_columns() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        client
            .execute_ddl(&[
                create_orders(),
                DdlStatement::AddColumns {
                    table: "Order".into(),
                    columns: vec![ColumnDescriptor::data("note", ColumnType::String)],
                },
            ])
            .await
            .unwrap();

        let live = client.live_columns("order").await.unwrap();
        let names: Vec<&str> = live.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["objectKey", "amount", "note"]);
    }

    #[tokio::test]
    async fn failed_ddl_rolls_back_the_batch() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        let err = client
            .execute_ddl(&[
                create_orders(),
                DdlStatement::AddColumns {
                    table: "Missing".into(),
                    columns: vec![ColumnDescriptor::data("x", ColumnType::String)],
                },
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "ddl error");
        assert!(client.live_columns("Order").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn writes_are_idempotent_per_primary_key() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        client
            .execute_ddl(&[create_orders(), create_items()])
            .await
            .unwrap();

        let rows = vec![
            row("Order", "objectKey", &[("objectKey", "k1"), ("amount", "12")]),
            row("Order0", "PK", &[("PK", "k1_0"), ("FK", "k1"), ("sku", "A")]),
        ];
        assert_eq!(client.write_rows(&rows).await.unwrap(), 2);
        assert_eq!(client.write_rows(&rows).await.unwrap(), 0);

        let changed = vec![row(
            "Order",
            "objectKey",
            &[("objectKey", "k1"), ("amount", "99")],
        )];
        assert_eq!(client.write_rows(&changed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_row_rolls_back_the_record() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        client
            .execute_ddl(&[create_orders(), create_items()])
            .await
            .unwrap();

        let rows = vec![
            row("Order", "objectKey", &[("objectKey", "k1")]),
            row("Order0", "PK", &[("PK", "k1_0"), ("FK", "k1"), ("nope", "x")]),
        ];
        assert!(client.write_rows(&rows).await.is_err());

        // nothing from the failed transaction survived
        let first = vec![row("Order", "objectKey", &[("objectKey", "k1")])];
        assert_eq!(client.write_rows(&first).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn naming_context_round_trips() {
        let client = SqliteRelationalClient::in_memory().unwrap();
        assert!(client.load_naming_context("Order").await.unwrap().is_empty());

        client
            .append_naming_context(
                "Order",
                &[("$.items".into(), 0), ("$.items.tags".into(), 1)],
            )
            .await
            .unwrap();
        client
            .append_naming_context("Order", &[("$.customer".into(), 2)])
            .await
            .unwrap();

        let mut ctx = client.load_naming_context("Order").await.unwrap();
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.index_of("$.items.tags"), Some(1));
        assert_eq!(ctx.index_for("$.new"), 3);
    }
}
