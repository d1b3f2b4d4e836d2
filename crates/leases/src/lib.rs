//! Lease-based distributed locks with durable metadata.
//!
//! A lease guards one resource, `{objectType}-{sink}`, for a fixed duration.
//! Whoever holds it may run a schema migration; on release the holder
//! stamps the agreed schema version into the resource metadata so other
//! instances can adopt it without migrating again.
//!
//! Backends implement the raw [`LeaseStore`] primitives. The polling and
//! marker-creation policy lives once, in [`LockService`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

mod errors;
mod mem_store;
mod service;

#[cfg(feature = "sqlite")]
mod sqlite_store;

pub use errors::{LockError, LockResult};
pub use mem_store::MemLeaseStore;
pub use service::{LeaseConfig, Lock, LockService};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteLeaseStore;

/// Metadata key carrying the schema version a migration converged on.
pub const SYNCED_SCHEMA_VERSION_KEY: &str = "syncedSchemaVersion";

/// Lock resource naming: one lease per object type and sink.
pub fn resource_id(object_type: &str, sink: &str) -> String {
    format!("{object_type}-{sink}")
}

/// Opaque proof of lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease state as seen by the store at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Available,
    Leased,
    Expired,
    Breaking,
    Broken,
}

/// Lock state as reported to callers of [`LockService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Available,
    LockObtained,
    AlreadyLocked,
    Breaking,
    Broken,
}

impl From<LeaseState> for LockState {
    fn from(state: LeaseState) -> Self {
        match state {
            LeaseState::Available | LeaseState::Expired => LockState::Available,
            LeaseState::Leased => LockState::AlreadyLocked,
            LeaseState::Breaking => LockState::Breaking,
            LeaseState::Broken => LockState::Broken,
        }
    }
}

/// Persistent lease row shared by every backend.
///
/// State is derived from timestamps so an expired holder never needs to
/// be cleaned up explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set once a break is requested; the lease is Broken from then on
    /// until re-acquired.
    pub break_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl LeaseRecord {
    pub fn state(&self, now: DateTime<Utc>) -> LeaseState {
        if let Some(break_at) = self.break_at {
            return if now < break_at {
                LeaseState::Breaking
            } else {
                LeaseState::Broken
            };
        }
        match (&self.lease_id, self.expires_at) {
            (Some(_), Some(expires)) if now < expires => LeaseState::Leased,
            (Some(_), _) => LeaseState::Expired,
            (None, _) => LeaseState::Available,
        }
    }

    /// `true` while nobody else may acquire the lease.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), LeaseState::Leased | LeaseState::Breaking)
    }

    pub(crate) fn try_acquire(
        &mut self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Option<LeaseToken> {
        if self.is_held(now) {
            return None;
        }
        let token = LeaseToken::generate();
        self.lease_id = Some(token.as_str().to_owned());
        self.expires_at = Some(now + to_chrono(duration));
        self.break_at = None;
        Some(token)
    }

    /// Release a lease we still own, optionally merging metadata first.
    pub(crate) fn release(
        &mut self,
        resource: &str,
        token: &LeaseToken,
        now: DateTime<Utc>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> LockResult<()> {
        let owned = self.lease_id.as_deref() == Some(token.as_str());
        if !owned || self.state(now) == LeaseState::Broken {
            return Err(LockError::LeaseLost {
                resource: resource.to_owned(),
            });
        }
        if let Some(metadata) = metadata {
            self.metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.lease_id = None;
        self.expires_at = None;
        self.break_at = None;
        Ok(())
    }

    /// Start breaking a held lease. Returns `false` when there is nothing
    /// to break.
    pub(crate) fn break_lease(
        &mut self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> bool {
        if self.state(now) != LeaseState::Leased {
            return false;
        }
        let mut break_at = now + to_chrono(period);
        if let Some(expires) = self.expires_at {
            break_at = break_at.min(expires);
        }
        if period.is_zero() {
            self.lease_id = None;
            self.expires_at = None;
        }
        self.break_at = Some(break_at);
        true
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Raw lease primitives implemented by each backend.
///
/// Every mutating call must be atomic with respect to other instances
/// sharing the same store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease marker for `resource` if it does not exist yet.
    async fn create_marker(&self, resource: &str) -> LockResult<()>;

    /// Try to take the lease. `Ok(None)` means someone else holds it;
    /// [`LockError::MarkerNotFound`] means the marker must be created first.
    async fn try_acquire(
        &self,
        resource: &str,
        duration: Duration,
    ) -> LockResult<Option<LeaseToken>>;

    /// Read the lease row without blocking. `None` if no marker exists.
    async fn properties(&self, resource: &str)
    -> LockResult<Option<LeaseRecord>>;

    /// Merge `metadata` (when given) and release, both conditioned on
    /// `token` still owning the lease.
    async fn release(
        &self,
        resource: &str,
        token: &LeaseToken,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> LockResult<()>;

    /// Break a held lease after `period`. Returns `false` if it was not held.
    async fn break_lease(
        &self,
        resource: &str,
        period: Duration,
    ) -> LockResult<bool>;
}
