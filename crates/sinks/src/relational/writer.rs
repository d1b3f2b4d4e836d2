//! Record to row writes, walking the payload the way inference did.

use schema_sensing::{
    FK_COLUMN, KeyDescriptor, PK_COLUMN, SchemaError, SchemaResult,
    TableDescriptor, json_kind,
};
use serde_json::Value;

/// One "insert unless the primary key exists" write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub table: String,
    pub primary_key_column: String,
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl RowWrite {
    fn new(table: &TableDescriptor) -> Self {
        Self {
            table: table.table_name.clone(),
            primary_key_column: table.primary_key_column().to_owned(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, column: &str, value: Option<String>) {
        if self.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            return;
        }
        self.columns.push(column.to_owned());
        self.values.push(value);
    }

    pub fn value(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values[i].as_deref())
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.value(&self.primary_key_column)
    }
}

/// Rows for `document` against its resolved tree, each parent row before
/// its children.
///
/// Child rows carry the parent's resolved key in `FK`; array elements get
/// `{key}_{index}` primary keys.
pub fn plan_rows(
    document: &Value,
    tree: &TableDescriptor,
    keys: &KeyDescriptor,
) -> SchemaResult<Vec<RowWrite>> {
    let mut rows = Vec::new();
    rows_at(document, tree, keys, &tree.table_name, &mut rows)?;
    Ok(rows)
}

fn rows_at(
    value: &Value,
    table: &TableDescriptor,
    keys: &KeyDescriptor,
    path: &str,
    out: &mut Vec<RowWrite>,
) -> SchemaResult<()> {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_object() {
                    return Err(SchemaError::NonObjectArrayElement {
                        path: format!("{path}[{i}]"),
                    });
                }
                rows_at(item, table, &keys.with_array_index(i), path, out)?;
            }
            Ok(())
        }
        Value::Object(fields) => {
            if table.is_empty() {
                return Ok(());
            }
            let primary_key = keys.primary_key(table.depth);
            let mut row = RowWrite::new(table);
            if !table.is_root() {
                row.push(PK_COLUMN, Some(primary_key.clone()));
                row.push(FK_COLUMN, Some(keys.foreign_key.clone()));
            }

            let mut nested = Vec::new();
            for (name, field) in fields {
                if field.is_object() || field.is_array() {
                    nested.push((name, field));
                    continue;
                }
                // payload fields named like key columns never override keys
                match table.column(name) {
                    Some(column) if !column.is_schema_column => {
                        row.push(&column.name, scalar_text(field));
                    }
                    _ => {}
                }
            }
            out.push(row);

            let child_keys = keys.for_children(&primary_key);
            for (name, field) in nested {
                let child = table.child(name).ok_or_else(|| {
                    SchemaError::MissingChildTable {
                        table: table.table_name.clone(),
                        field: name.clone(),
                    }
                })?;
                rows_at(field, child, &child_keys, &format!("{path}.{name}"), out)?;
            }
            Ok(())
        }
        other => Err(SchemaError::UnexpectedValue {
            path: path.to_owned(),
            kind: json_kind(other),
        }),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
