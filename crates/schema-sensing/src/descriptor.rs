//! Table, column and key descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root tables are keyed by the record's own key.
pub const OBJECT_KEY_COLUMN: &str = "objectKey";
/// Synthesized primary key of every non-root table.
pub const PK_COLUMN: &str = "PK";
/// Synthesized reference from a child row to its parent row.
pub const FK_COLUMN: &str = "FK";

/// Semantic column type. Sink adapters translate these to native types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    DateTime,
    Key,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::DateTime => "datetime",
            ColumnType::Key => "key",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    /// `PK`/`FK` key columns: part of DDL, never filled from payload data.
    #[serde(default)]
    pub is_schema_column: bool,
}

impl ColumnDescriptor {
    pub fn data(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_schema_column: false,
        }
    }

    pub fn schema(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Key,
            is_schema_column: true,
        }
    }
}

/// One table in an inferred tree.
///
/// Column names are unique ignoring case. Children are keyed by the JSON
/// field they were inferred from; `table_name` starts out equal to
/// `source_name` and is rewritten by
/// [`resolve_table_names`](crate::resolve_table_names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub source_name: String,
    pub table_name: String,
    pub depth: usize,
    pub columns: Vec<ColumnDescriptor>,
    pub children: Vec<TableDescriptor>,
}

impl TableDescriptor {
    pub fn new(source_name: impl Into<String>, depth: usize) -> Self {
        let source_name = source_name.into();
        Self {
            table_name: source_name.clone(),
            source_name,
            depth,
            columns: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Empty tables are never created nor written.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.children.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDescriptor> {
        self.columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn child(&self, source_name: &str) -> Option<&TableDescriptor> {
        self.children.iter().find(|c| c.source_name == source_name)
    }

    /// Columns filled from payload fields.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| !c.is_schema_column)
    }

    /// Append `column` unless a column with that name exists already.
    /// The first occurrence keeps its type.
    pub fn add_column(&mut self, column: ColumnDescriptor) -> bool {
        if self.column(&column.name).is_some() {
            return false;
        }
        self.columns.push(column);
        true
    }

    /// Add a child table, merging into an existing child of the same name.
    pub fn add_child(&mut self, child: TableDescriptor) {
        match self
            .children
            .iter_mut()
            .find(|c| c.source_name == child.source_name)
        {
            Some(existing) => existing.merge(child),
            None => self.children.push(child),
        }
    }

    /// Union of columns (first occurrence wins) and children (recursively).
    pub fn merge(&mut self, other: TableDescriptor) {
        for column in other.columns {
            self.add_column(column);
        }
        for child in other.children {
            self.add_child(child);
        }
    }

    /// Name of the column holding this table's row key.
    pub fn primary_key_column(&self) -> &'static str {
        if self.is_root() {
            OBJECT_KEY_COLUMN
        } else {
            PK_COLUMN
        }
    }

    /// Name of the parent's key column this table's `FK` points at.
    pub fn parent_key_column(&self) -> Option<&'static str> {
        match self.depth {
            0 => None,
            1 => Some(OBJECT_KEY_COLUMN),
            _ => Some(PK_COLUMN),
        }
    }

    /// All tables in the tree, each parent before its children.
    pub fn tables(&self) -> Vec<&TableDescriptor> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.tables());
        }
        out
    }

    /// Structural equality ignoring column and child order.
    pub fn is_equivalent(&self, other: &TableDescriptor) -> bool {
        let same_columns = self.columns.len() == other.columns.len()
            && self.columns.iter().all(|c| {
                other.column(&c.name).is_some_and(|o| {
                    o.column_type == c.column_type
                        && o.is_schema_column == c.is_schema_column
                })
            });
        let same_children = self.children.len() == other.children.len()
            && self.children.iter().all(|c| {
                other
                    .child(&c.source_name)
                    .is_some_and(|o| c.is_equivalent(o))
            });

        self.source_name == other.source_name
            && self.depth == other.depth
            && same_columns
            && same_children
    }
}

/// Row keys carried down the recursion of the relational writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// The record's `objectKey`.
    pub root_key: String,
    /// Resolved primary key of the parent row.
    pub foreign_key: String,
    /// Position within the enclosing array, if any.
    pub array_index: Option<usize>,
}

impl KeyDescriptor {
    pub fn root(object_key: impl Into<String>) -> Self {
        let key = object_key.into();
        Self {
            foreign_key: key.clone(),
            root_key: key,
            array_index: None,
        }
    }

    /// Primary key of the row written at `depth`.
    pub fn primary_key(&self, depth: usize) -> String {
        let base = if depth == 0 {
            &self.root_key
        } else {
            &self.foreign_key
        };
        match self.array_index {
            Some(i) => format!("{base}_{i}"),
            None => base.clone(),
        }
    }

    pub fn with_array_index(&self, index: usize) -> Self {
        Self {
            array_index: Some(index),
            ..self.clone()
        }
    }

    /// Keys for the children of the row keyed `primary_key`.
    pub fn for_children(&self, primary_key: &str) -> Self {
        Self {
            root_key: self.root_key.clone(),
            foreign_key: primary_key.to_owned(),
            array_index: None,
        }
    }
}
