use super::{LeaseRecord, LeaseStore, LeaseToken, LockError, LockResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

/// Process-local lease store.
///
/// Shared through an `Arc` it gives every task in the process the same
/// contention behavior as a remote store, which is what the tests and the
/// single-host runner rely on.
#[derive(Default)]
pub struct MemLeaseStore {
    map: RwLock<HashMap<String, LeaseRecord>>,
}

impl MemLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemLeaseStore {
    async fn create_marker(&self, resource: &str) -> LockResult<()> {
        let mut map = self.map.write().await;
        map.entry(resource.to_owned()).or_default();
        Ok(())
    }

    async fn try_acquire(
        &self,
        resource: &str,
        duration: Duration,
    ) -> LockResult<Option<LeaseToken>> {
        let mut map = self.map.write().await;
        let rec = map.get_mut(resource).ok_or_else(|| {
            LockError::MarkerNotFound {
                resource: resource.to_owned(),
            }
        })?;
        Ok(rec.try_acquire(Utc::now(), duration))
    }

    async fn properties(
        &self,
        resource: &str,
    ) -> LockResult<Option<LeaseRecord>> {
        Ok(self.map.read().await.get(resource).cloned())
    }

    async fn release(
        &self,
        resource: &str,
        token: &LeaseToken,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> LockResult<()> {
        let mut map = self.map.write().await;
        match map.get_mut(resource) {
            Some(rec) => rec.release(resource, token, Utc::now(), metadata),
            None => Err(LockError::LeaseLost {
                resource: resource.to_owned(),
            }),
        }
    }

    async fn break_lease(
        &self,
        resource: &str,
        period: Duration,
    ) -> LockResult<bool> {
        let mut map = self.map.write().await;
        Ok(map
            .get_mut(resource)
            .is_some_and(|rec| rec.break_lease(Utc::now(), period)))
    }
}
