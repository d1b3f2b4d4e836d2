//! Versioned schema coordination across instances.
//!
//! Every record carries a `dataVersion`. Each instance remembers the
//! newest version it has seen applied to a sink (a cheap in-memory fast
//! path); the lease metadata holds the version all instances agreed on.
//! When a record is newer than both, exactly one instance migrates under
//! the lease while the others wait and adopt the result.

use parking_lot::RwLock;
use std::collections::HashMap;

mod coordinator;
pub use coordinator::{Migration, MigrationTrigger, SchemaCoordinator};

/// How a record's version relates to the last synced schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheckResult {
    /// Same version as the synced schema.
    Current,
    /// The synced schema predates the record; additive columns may be due.
    Older,
    /// The synced schema is ahead of the record (out-of-order delivery).
    Newer,
    /// No version has ever been synced for this object type and sink.
    Unknown,
}

impl SchemaCheckResult {
    pub fn is_update_required(&self) -> bool {
        matches!(self, SchemaCheckResult::Older | SchemaCheckResult::Unknown)
    }
}

/// Compare a record's version to a known synced version. Versions are
/// ordered as plain strings, so producers must emit sortable values
/// (ISO-8601 timestamps, zero-padded counters).
pub fn compare_versions(incoming: &str, synced: &str) -> SchemaCheckResult {
    match incoming.cmp(synced) {
        std::cmp::Ordering::Greater => SchemaCheckResult::Older,
        std::cmp::Ordering::Equal => SchemaCheckResult::Current,
        std::cmp::Ordering::Less => SchemaCheckResult::Newer,
    }
}

/// Per-instance cache of synced versions, keyed by object type.
pub trait SchemaVersionCache: Send + Sync {
    fn get(&self, object_type: &str) -> Option<String>;

    /// Overwrite with the authoritative durable version.
    fn set(&self, object_type: &str, version: &str);

    /// Atomically raise the cached version to `version` unless the cache
    /// already holds a greater one. Returns `true` if the cache changed.
    fn advance(&self, object_type: &str, version: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct MemSchemaVersionCache {
    inner: RwLock<HashMap<String, String>>,
}

impl MemSchemaVersionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaVersionCache for MemSchemaVersionCache {
    fn get(&self, object_type: &str) -> Option<String> {
        self.inner.read().get(object_type).cloned()
    }

    fn set(&self, object_type: &str, version: &str) {
        self.inner
            .write()
            .insert(object_type.to_owned(), version.to_owned());
    }

    fn advance(&self, object_type: &str, version: &str) -> bool {
        let mut guard = self.inner.write();
        match guard.get(object_type) {
            Some(current) if current.as_str() >= version => false,
            _ => {
                guard.insert(object_type.to_owned(), version.to_owned());
                true
            }
        }
    }
}
