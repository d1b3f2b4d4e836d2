use super::{
    LeaseStore, LeaseToken, LockError, LockResult, LockState,
    SYNCED_SCHEMA_VERSION_KEY,
};
use chrono::Utc;
use common::{sleep_or_cancelled, watchdog};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lease timing.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long an obtained lease stays valid without renewal.
    pub lease_duration: Duration,
    /// Interval between probes while waiting for a peer's lease.
    pub poll_interval: Duration,
    /// Upper bound on any single store call.
    pub call_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of [`LockService::obtain_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lock {
    Obtained(LeaseToken),
    AlreadyLocked,
}

impl Lock {
    pub fn state(&self) -> LockState {
        match self {
            Lock::Obtained(_) => LockState::LockObtained,
            Lock::AlreadyLocked => LockState::AlreadyLocked,
        }
    }
}

/// Lock protocol on top of a [`LeaseStore`].
///
/// Contention is reported through [`Lock`] and [`LockState`], never as an
/// error. Store and transport failures propagate. Every store call is
/// bounded by [`LeaseConfig::call_timeout`] and by the caller's token.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LeaseStore>,
    cfg: LeaseConfig,
}

/// Rounds of create-marker-then-acquire before giving up.
const MAX_MARKER_ROUNDS: usize = 3;

impl LockService {
    pub fn new(store: Arc<dyn LeaseStore>, cfg: LeaseConfig) -> Self {
        Self { store, cfg }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.cfg
    }

    async fn guarded<T, Fut>(
        &self,
        op: Fut,
        cancel: &CancellationToken,
        label: &'static str,
    ) -> LockResult<T>
    where
        Fut: Future<Output = LockResult<T>>,
    {
        watchdog(op, self.cfg.call_timeout, cancel, label)
            .await
            .map_err(LockError::from)
    }

    /// Try to take the lease on `resource`, creating its marker on first use.
    pub async fn obtain_lock(
        &self,
        resource: &str,
        cancel: &CancellationToken,
    ) -> LockResult<Lock> {
        for _ in 0..MAX_MARKER_ROUNDS {
            let acquire = self.store.try_acquire(resource, self.cfg.lease_duration);
            match self.guarded(acquire, cancel, "try_acquire").await {
                Ok(Some(token)) => {
                    debug!(resource, "lease obtained");
                    return Ok(Lock::Obtained(token));
                }
                Ok(None) => return Ok(Lock::AlreadyLocked),
                Err(LockError::MarkerNotFound { .. }) => {
                    debug!(resource, "creating lease marker");
                    self.guarded(
                        self.store.create_marker(resource),
                        cancel,
                        "create_marker",
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(LockError::MarkerNotFound {
            resource: resource.to_owned(),
        })
    }

    /// Record `version` as the synced schema version and release, both
    /// conditioned on `token`.
    pub async fn release_lock(
        &self,
        resource: &str,
        token: &LeaseToken,
        version: &str,
        cancel: &CancellationToken,
    ) -> LockResult<()> {
        let metadata = BTreeMap::from([(
            SYNCED_SCHEMA_VERSION_KEY.to_owned(),
            version.to_owned(),
        )]);
        self.guarded(
            self.store.release(resource, token, Some(&metadata)),
            cancel,
            "release",
        )
        .await?;
        debug!(resource, version, "lease released");
        Ok(())
    }

    /// Release without touching metadata, after a failed migration.
    pub async fn abandon_lock(
        &self,
        resource: &str,
        token: &LeaseToken,
        cancel: &CancellationToken,
    ) -> LockResult<()> {
        self.guarded(self.store.release(resource, token, None), cancel, "release")
            .await?;
        warn!(resource, "lease abandoned without recording a version");
        Ok(())
    }

    /// Poll until nobody holds the lease, then report the state found.
    ///
    /// Returns [`LockError::Cancelled`] if `cancel` fires first.
    pub async fn wait_for_lock_dissolved(
        &self,
        resource: &str,
        cancel: &CancellationToken,
    ) -> LockResult<LockState> {
        loop {
            let record = self
                .guarded(self.store.properties(resource), cancel, "properties")
                .await?;
            let now = Utc::now();
            match record {
                None => return Ok(LockState::Available),
                Some(rec) if !rec.is_held(now) => {
                    return Ok(rec.state(now).into());
                }
                Some(_) => {}
            }

            if !sleep_or_cancelled(cancel, self.cfg.poll_interval).await {
                return Err(LockError::Cancelled);
            }
        }
    }

    /// Non-blocking metadata read. `None` if the resource was never locked.
    pub async fn get_metadata(
        &self,
        resource: &str,
        cancel: &CancellationToken,
    ) -> LockResult<Option<BTreeMap<String, String>>> {
        Ok(self
            .guarded(self.store.properties(resource), cancel, "properties")
            .await?
            .map(|rec| rec.metadata))
    }

    pub async fn synced_version(
        &self,
        resource: &str,
        cancel: &CancellationToken,
    ) -> LockResult<Option<String>> {
        Ok(self
            .get_metadata(resource, cancel)
            .await?
            .and_then(|mut m| m.remove(SYNCED_SCHEMA_VERSION_KEY)))
    }

    /// Forcibly break a peer's lease after `period` (operator recovery).
    pub async fn break_lock(
        &self,
        resource: &str,
        period: Duration,
        cancel: &CancellationToken,
    ) -> LockResult<bool> {
        let broken = self
            .guarded(self.store.break_lease(resource, period), cancel, "break_lease")
            .await?;
        if broken {
            warn!(resource, ?period, "lease break requested");
        }
        Ok(broken)
    }
}
