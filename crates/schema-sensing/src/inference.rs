//! Payload to table-tree inference.

use crate::descriptor::{
    ColumnDescriptor, ColumnType, FK_COLUMN, PK_COLUMN, TableDescriptor,
};
use crate::errors::{SchemaError, SchemaResult};
use crate::naming::{ROOT_PATH, child_path};
use serde_json::Value;

/// Infer the table tree for one payload. `root_table` names the depth-0
/// table, normally the record's object type.
///
/// Nothing is named yet; see
/// [`resolve_table_names`](crate::resolve_table_names).
pub fn infer_tree(
    root_table: &str,
    value: &Value,
) -> SchemaResult<TableDescriptor> {
    infer_at(root_table, value, 0, ROOT_PATH)
}

fn infer_at(
    source_name: &str,
    value: &Value,
    depth: usize,
    path: &str,
) -> SchemaResult<TableDescriptor> {
    let mut table = TableDescriptor::new(source_name, depth);
    if depth > 0 {
        table.add_column(ColumnDescriptor::schema(PK_COLUMN));
        table.add_column(ColumnDescriptor::schema(FK_COLUMN));
    }

    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_object() {
                    return Err(SchemaError::NonObjectArrayElement {
                        path: format!("{path}[{i}]"),
                    });
                }
                // elements share the array's table
                table.merge(infer_at(source_name, item, depth, path)?);
            }
        }
        Value::Object(fields) => {
            for (name, field) in fields {
                if field.is_object() || field.is_array() {
                    let nested = child_path(path, name);
                    table.add_child(infer_at(name, field, depth + 1, &nested)?);
                } else {
                    table.add_column(ColumnDescriptor::data(
                        name.as_str(),
                        ColumnType::String,
                    ));
                }
            }
        }
        other => {
            return Err(SchemaError::UnexpectedValue {
                path: path.to_owned(),
                kind: json_kind(other),
            });
        }
    }

    Ok(table)
}

/// Short JSON type name for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
