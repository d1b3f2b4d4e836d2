use crate::{SchemaCheckResult, SchemaVersionCache, compare_versions};
use leases::{Lock, LockResult, LockService, LockState, resource_id};
use schemaforge_core::{IngestError, IngestResult, SinkKind};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a migration was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTrigger {
    /// The record's version is ahead of the synced version. Skipped if a
    /// peer reached the version while we waited for the lease.
    Version,
    /// The sink is missing structure the record needs even though the
    /// version is current. Always runs once the lease is held.
    Shape,
}

/// Result of [`SchemaCoordinator::ensure_migrated`].
#[derive(Debug)]
pub enum Migration<T> {
    /// This instance ran the migration.
    Performed(T),
    /// A peer's migration already covers the requested version.
    Adopted,
}

/// Schema version check and lease-guarded migration for one sink.
pub struct SchemaCoordinator {
    sink: SinkKind,
    locks: LockService,
    cache: Arc<dyn SchemaVersionCache>,
}

impl SchemaCoordinator {
    pub fn new(
        sink: SinkKind,
        locks: LockService,
        cache: Arc<dyn SchemaVersionCache>,
    ) -> Self {
        Self { sink, locks, cache }
    }

    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    pub fn resource(&self, object_type: &str) -> String {
        resource_id(object_type, self.sink.as_str())
    }

    /// Version this instance last saw synced, without any store access.
    pub fn cached_version(&self, object_type: &str) -> Option<String> {
        self.cache.get(object_type)
    }

    /// Compare `version` against the cached version, falling back to the
    /// durable lease metadata when the cache is missing or behind.
    pub async fn check_schema(
        &self,
        object_type: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> LockResult<SchemaCheckResult> {
        if let Some(cached) = self.cache.get(object_type) {
            let result = compare_versions(version, &cached);
            if result != SchemaCheckResult::Older {
                debug!(sink = %self.sink, object_type, version, ?result, "schema check (cached)");
                if result == SchemaCheckResult::Newer {
                    warn!(
                        sink = %self.sink,
                        object_type,
                        version,
                        synced = %cached,
                        "record older than synced schema"
                    );
                }
                return Ok(result);
            }
        }

        let resource = self.resource(object_type);
        let Some(durable) = self.locks.synced_version(&resource, cancel).await? else {
            debug!(sink = %self.sink, object_type, version, "no synced schema yet");
            return Ok(SchemaCheckResult::Unknown);
        };
        self.cache.set(object_type, &durable);

        let result = compare_versions(version, &durable);
        debug!(sink = %self.sink, object_type, version, synced = %durable, ?result, "schema check (durable)");
        Ok(result)
    }

    /// Make sure the sink schema for `object_type` covers `version`,
    /// running `migrate` under the lease if this instance obtains it.
    ///
    /// At most one instance runs `migrate` for a resource at a time. The
    /// synced version is recorded only after `migrate` succeeds; on failure
    /// the lease is released with the previous version intact.
    pub async fn ensure_migrated<T, F, Fut>(
        &self,
        object_type: &str,
        version: &str,
        trigger: MigrationTrigger,
        cancel: &CancellationToken,
        mut migrate: F,
    ) -> IngestResult<Migration<T>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = IngestResult<T>> + Send,
        T: Send,
    {
        let resource = self.resource(object_type);
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            match self.locks.obtain_lock(&resource, cancel).await? {
                Lock::Obtained(token) => {
                    return self
                        .migrate_under_lease(
                            object_type,
                            version,
                            trigger,
                            &resource,
                            token,
                            cancel,
                            &mut migrate,
                        )
                        .await;
                }
                Lock::AlreadyLocked => {
                    debug!(%resource, version, "waiting for peer migration");
                    let state = self
                        .locks
                        .wait_for_lock_dissolved(&resource, cancel)
                        .await?;
                    if state == LockState::Available {
                        let check =
                            self.check_schema(object_type, version, cancel).await?;
                        if !check.is_update_required() {
                            info!(%resource, version, "adopted peer schema migration");
                            return Ok(Migration::Adopted);
                        }
                    }
                }
            }
        }
    }

    async fn migrate_under_lease<T, F, Fut>(
        &self,
        object_type: &str,
        version: &str,
        trigger: MigrationTrigger,
        resource: &str,
        token: leases::LeaseToken,
        cancel: &CancellationToken,
        migrate: &mut F,
    ) -> IngestResult<Migration<T>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = IngestResult<T>> + Send,
        T: Send,
    {
        let durable = match self.locks.synced_version(resource, cancel).await {
            Ok(durable) => durable,
            Err(e) => {
                self.abandon(resource, &token, cancel).await;
                return Err(e.into());
            }
        };

        if trigger == MigrationTrigger::Version
            && let Some(durable) = &durable
            && !compare_versions(version, durable).is_update_required()
        {
            self.locks
                .release_lock(resource, &token, durable, cancel)
                .await?;
            self.cache.set(object_type, durable);
            info!(%resource, version, synced = %durable, "schema already migrated by peer");
            return Ok(Migration::Adopted);
        }

        match migrate().await {
            Ok(out) => {
                // the synced version never moves backwards
                let agreed = match &durable {
                    Some(d) if d.as_str() > version => d.as_str(),
                    _ => version,
                };
                self.locks
                    .release_lock(resource, &token, agreed, cancel)
                    .await?;
                self.cache.advance(object_type, agreed);
                info!(%resource, version = agreed, ?trigger, "schema migration committed");
                Ok(Migration::Performed(out))
            }
            Err(e) => {
                self.abandon(resource, &token, cancel).await;
                Err(e)
            }
        }
    }

    async fn abandon(
        &self,
        resource: &str,
        token: &leases::LeaseToken,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self.locks.abandon_lock(resource, token, cancel).await {
            warn!(resource, error = %e, "failed to abandon lease, it will expire");
        }
    }
}
