//! Schema Sensing - relational table trees inferred from JSON payloads.
//!
//! A record becomes a tree of table descriptors: scalar fields are string
//! columns, nested objects and arrays become child tables one level deeper
//! with synthesized `PK`/`FK` key columns. Array elements share their
//! parent's table and are merged into one descriptor.
//!
//! # Features
//!
//! - **Inference**: [`infer_tree`] walks a payload into a [`TableDescriptor`]
//! - **Merge**: order-independent union of columns and child tables
//! - **Stable naming**: [`TableNamingContext`] maps JSON paths to durable
//!   table indices so `$.items` is always `Order0`, whoever saw it first
//!
//! # Example
//!
//! ```
//! use schema_sensing::{TableNamingContext, infer_tree, resolve_table_names};
//! use serde_json::json;
//!
//! let payload = json!({"objectKey": "k1", "items": [{"n": "1"}, {"n": "2"}]});
//! let mut tree = infer_tree("Order", &payload).unwrap();
//!
//! let mut ctx = TableNamingContext::default();
//! resolve_table_names(&mut tree, &mut ctx).unwrap();
//!
//! assert_eq!(tree.table_name, "Order");
//! assert_eq!(tree.children[0].table_name, "Order0");
//! assert_eq!(ctx.allocated(), &[("$.items".to_owned(), 0)]);
//! ```

mod descriptor;
mod errors;
mod inference;
mod naming;

pub use descriptor::{
    ColumnDescriptor, ColumnType, FK_COLUMN, KeyDescriptor, OBJECT_KEY_COLUMN,
    PK_COLUMN, TableDescriptor,
};
pub use errors::{SchemaError, SchemaResult};
pub use inference::{infer_tree, json_kind};
pub use naming::{ROOT_PATH, TableNamingContext, child_path, resolve_table_names};
