//! Error types for schema inference.

use thiserror::Error;

/// Structural problems with a payload. Fatal for the record being
/// ingested; retrying the same payload cannot succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Arrays may only contain objects.
    #[error("array element at {path} is not an object")]
    NonObjectArrayElement { path: String },

    /// A scalar showed up where an object or array was required.
    #[error("unexpected {kind} at {path}, expected an object or array")]
    UnexpectedValue { path: String, kind: &'static str },

    /// The root table has no `objectKey` column to key rows on.
    #[error("table `{table}` has no `objectKey` column")]
    MissingKeyColumn { table: String },

    /// The payload has a nested field the resolved tree does not know.
    #[error("no child table for field `{field}` under `{table}`")]
    MissingChildTable { table: String, field: String },
}

/// Result type for inference operations.
pub type SchemaResult<T> = Result<T, SchemaError>;
