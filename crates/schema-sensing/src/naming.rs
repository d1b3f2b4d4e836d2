//! Durable child-table naming.
//!
//! Child tables are named `{root}{index}` where the index is looked up by
//! the child's JSON path from the root, e.g. `$.items.tags`. Indices are
//! allocated once and never change, so every instance writing an object
//! type agrees on table names for the lifetime of the database.

use crate::descriptor::{ColumnType, OBJECT_KEY_COLUMN, TableDescriptor};
use crate::errors::{SchemaError, SchemaResult};
use std::collections::HashMap;
use tracing::debug;

/// Path of the root table.
pub const ROOT_PATH: &str = "$";

pub fn child_path(parent: &str, field: &str) -> String {
    format!("{parent}.{field}")
}

/// Path to index mapping for one object type.
///
/// Loaded in full from the store, extended in memory, and the new
/// entries ([`TableNamingContext::allocated`]) appended back.
#[derive(Debug, Clone, Default)]
pub struct TableNamingContext {
    indices: HashMap<String, usize>,
    next_index: usize,
    allocated: Vec<(String, usize)>,
}

impl TableNamingContext {
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, usize)>,
    ) -> Self {
        let indices: HashMap<String, usize> = entries.into_iter().collect();
        let next_index = indices.values().max().map_or(0, |max| max + 1);
        Self {
            indices,
            next_index,
            allocated: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.indices.get(path).copied()
    }

    /// Index for `path`, allocating a fresh one above every existing index
    /// on first sight.
    pub fn index_for(&mut self, path: &str) -> usize {
        if let Some(index) = self.indices.get(path) {
            return *index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(path.to_owned(), index);
        self.allocated.push((path.to_owned(), index));
        debug!(path, index, "allocated table index");
        index
    }

    /// Entries allocated since this context was loaded, in allocation order.
    pub fn allocated(&self) -> &[(String, usize)] {
        &self.allocated
    }

    /// All entries ordered by index.
    pub fn entries(&self) -> Vec<(String, usize)> {
        let mut out: Vec<_> =
            self.indices.iter().map(|(p, i)| (p.clone(), *i)).collect();
        out.sort_by_key(|(_, i)| *i);
        out
    }
}

/// Name every table in `tree` through `ctx` and force the root key column
/// to the key type.
pub fn resolve_table_names(
    tree: &mut TableDescriptor,
    ctx: &mut TableNamingContext,
) -> SchemaResult<()> {
    let root = tree.source_name.clone();
    let key = tree.column_mut(OBJECT_KEY_COLUMN).ok_or_else(|| {
        SchemaError::MissingKeyColumn {
            table: root.clone(),
        }
    })?;
    key.column_type = ColumnType::Key;

    tree.table_name = root.clone();
    for child in &mut tree.children {
        name_child(child, &root, ROOT_PATH, ctx);
    }
    Ok(())
}

fn name_child(
    table: &mut TableDescriptor,
    root: &str,
    parent_path: &str,
    ctx: &mut TableNamingContext,
) {
    let path = child_path(parent_path, &table.source_name);
    table.table_name = format!("{root}{}", ctx.index_for(&path));
    for child in &mut table.children {
        name_child(child, root, &path, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer_tree;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn known_paths_keep_their_index() {
        let mut ctx = TableNamingContext::from_entries([
            ("$.items".to_owned(), 0),
            ("$.customer".to_owned(), 1),
        ]);

        let mut tree = infer_tree(
            "Order",
            &json!({"objectKey": "k", "customer": {"n": "x"}, "items": []}),
        )
        .unwrap();
        resolve_table_names(&mut tree, &mut ctx).unwrap();

        assert_eq!(tree.child("customer").unwrap().table_name, "Order1");
        assert_eq!(tree.child("items").unwrap().table_name, "Order0");
        assert!(ctx.allocated().is_empty());
    }

    #[test]
    fn new_paths_get_indices_above_all_existing() {
        let mut ctx = TableNamingContext::from_entries([
            ("$.a".to_owned(), 0),
            ("$.b".to_owned(), 4),
        ]);
        let mut tree = infer_tree(
            "T",
            &json!({"objectKey": "k", "c": {"x": "1", "d": [{"y": "2"}]}}),
        )
        .unwrap();
        resolve_table_names(&mut tree, &mut ctx).unwrap();

        let c = tree.child("c").unwrap();
        assert_eq!(c.table_name, "T5");
        assert_eq!(c.child("d").unwrap().table_name, "T6");
        assert_eq!(
            ctx.allocated(),
            &[("$.c".to_owned(), 5), ("$.c.d".to_owned(), 6)]
        );
        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx.entries().last().unwrap(), &("$.c.d".to_owned(), 6));
    }

    #[test]
    fn root_key_is_forced_to_key_type() {
        let mut tree = infer_tree("T", &json!({"ObjectKey": "k", "a": "x"})).unwrap();
        resolve_table_names(&mut tree, &mut TableNamingContext::default()).unwrap();

        assert_eq!(tree.table_name, "T");
        assert_eq!(tree.column("objectKey").unwrap().column_type, ColumnType::Key);
        assert_eq!(tree.column("a").unwrap().column_type, ColumnType::String);
    }

    #[test]
    fn missing_root_key_is_an_error() {
        let mut tree = infer_tree("T", &json!({"a": "x"})).unwrap();
        let err = resolve_table_names(&mut tree, &mut TableNamingContext::default())
            .unwrap_err();
        assert_eq!(err, SchemaError::MissingKeyColumn { table: "T".into() });
    }

    #[test]
    fn same_field_name_at_different_paths_gets_distinct_tables() {
        let mut ctx = TableNamingContext::default();
        let mut tree = infer_tree(
            "T",
            &json!({"objectKey": "k", "a": {"tags": []}, "b": {"tags": []}}),
        )
        .unwrap();
        resolve_table_names(&mut tree, &mut ctx).unwrap();

        let a_tags = &tree.child("a").unwrap().child("tags").unwrap().table_name;
        let b_tags = &tree.child("b").unwrap().child("tags").unwrap().table_name;
        assert_ne!(a_tags, b_tags);
        assert_eq!(ctx.index_of("$.b.tags"), Some(3));
    }
}
