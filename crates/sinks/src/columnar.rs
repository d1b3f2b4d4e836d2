//! Helpers shared by the single-table sinks (analytics, log workspace).

use crate::ddl::LiveColumn;
use schema_sensing::{ColumnDescriptor, ColumnType, OBJECT_KEY_COLUMN, TableDescriptor};
use schemaforge_core::Record;

pub fn native_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String | ColumnType::Key => "string",
        ColumnType::DateTime => "datetime",
    }
}

pub fn column_from_live(live: &LiveColumn) -> ColumnDescriptor {
    let column_type = if live.native_type.eq_ignore_ascii_case("datetime") {
        ColumnType::DateTime
    } else {
        ColumnType::String
    };
    ColumnDescriptor::data(live.name.as_str(), column_type)
}

/// One flat table holding `leading` columns, then every field of the
/// record's flattened document.
pub fn flat_table(
    table_name: &str,
    record: &Record,
    leading: &[ColumnDescriptor],
) -> TableDescriptor {
    let mut table = TableDescriptor::new(table_name, 0);
    for column in leading {
        table.add_column(column.clone());
    }
    for name in record.document().keys() {
        let column_type = if name == OBJECT_KEY_COLUMN {
            ColumnType::Key
        } else {
            ColumnType::String
        };
        table.add_column(ColumnDescriptor::data(name.as_str(), column_type));
    }
    table
}

/// Live columns followed by the missing ones: what the table looks like
/// after an additive merge.
pub fn merged_columns(
    live: &[LiveColumn],
    missing: &[ColumnDescriptor],
) -> Vec<ColumnDescriptor> {
    live.iter()
        .map(column_from_live)
        .chain(missing.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn flat_table_lists_document_fields() {
        let record = Record::from_element(&json!({
            "objectKey": "k1", "objectType": "T", "dataVersion": "v1",
            "a": "x", "data": {"items": [{"n": 1}]}
        }))
        .unwrap();

        let table = flat_table(
            "T_CL",
            &record,
            &[ColumnDescriptor::data("TimeGenerated", ColumnType::DateTime)],
        );
        let columns: Vec<(&str, ColumnType)> = table
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect();
        assert_eq!(
            columns,
            vec![
                ("TimeGenerated", ColumnType::DateTime),
                ("objectKey", ColumnType::Key),
                ("a", ColumnType::String),
                ("items", ColumnType::String),
            ]
        );
        assert!(table.children.is_empty());
    }
}
