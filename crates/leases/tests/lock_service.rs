use async_trait::async_trait;
use leases::{
    LeaseConfig, LeaseRecord, LeaseStore, LeaseToken, Lock, LockError,
    LockResult, LockService, LockState, MemLeaseStore,
    SYNCED_SCHEMA_VERSION_KEY, SqliteLeaseStore, resource_id,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn fast_cfg() -> LeaseConfig {
    LeaseConfig {
        lease_duration: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        call_timeout: Duration::from_secs(2),
    }
}

fn services(store: Arc<dyn LeaseStore>) -> (LockService, LockService) {
    (
        LockService::new(store.clone(), fast_cfg()),
        LockService::new(store, fast_cfg()),
    )
}

#[tokio::test]
async fn obtain_creates_marker_and_excludes_peers() {
    let (a, b) = services(Arc::new(MemLeaseStore::new()));
    let res = resource_id("Order", "relational");
    let cancel = CancellationToken::new();

    let lock = a.obtain_lock(&res, &cancel).await.unwrap();
    assert_eq!(lock.state(), LockState::LockObtained);
    assert_eq!(b.obtain_lock(&res, &cancel).await.unwrap(), Lock::AlreadyLocked);

    let Lock::Obtained(token) = lock else {
        panic!("expected obtained lock");
    };
    a.release_lock(&res, &token, "v1", &cancel).await.unwrap();

    assert_eq!(
        b.synced_version(&res, &cancel).await.unwrap().as_deref(),
        Some("v1")
    );
    let meta = b.get_metadata(&res, &cancel).await.unwrap().unwrap();
    assert_eq!(meta.get(SYNCED_SCHEMA_VERSION_KEY).unwrap(), "v1");
    assert_eq!(
        b.obtain_lock(&res, &cancel).await.unwrap().state(),
        LockState::LockObtained
    );
}

#[tokio::test]
async fn metadata_absent_for_unknown_resource() {
    let (a, _) = services(Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();
    assert!(a.get_metadata("Nope-analytics", &cancel).await.unwrap().is_none());
    assert!(a.synced_version("Nope-analytics", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn abandon_keeps_previous_version() {
    let (a, _) = services(Arc::new(MemLeaseStore::new()));
    let res = resource_id("Order", "analytics");
    let cancel = CancellationToken::new();

    let Lock::Obtained(t1) = a.obtain_lock(&res, &cancel).await.unwrap() else {
        panic!("expected lock");
    };
    a.release_lock(&res, &t1, "v1", &cancel).await.unwrap();

    let Lock::Obtained(t2) = a.obtain_lock(&res, &cancel).await.unwrap() else {
        panic!("expected lock");
    };
    a.abandon_lock(&res, &t2, &cancel).await.unwrap();
    assert_eq!(
        a.synced_version(&res, &cancel).await.unwrap().as_deref(),
        Some("v1")
    );
}

#[tokio::test]
async fn wait_returns_once_holder_releases() {
    let (a, b) = services(Arc::new(MemLeaseStore::new()));
    let res = resource_id("Order", "relational");
    let cancel = CancellationToken::new();

    let Lock::Obtained(token) = a.obtain_lock(&res, &cancel).await.unwrap() else {
        panic!("expected lock");
    };

    let holder = tokio::spawn({
        let res = res.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.release_lock(&res, &token, "v2", &CancellationToken::new())
                .await
                .unwrap();
        }
    });

    let state = b.wait_for_lock_dissolved(&res, &cancel).await.unwrap();
    assert_eq!(state, LockState::Available);
    assert_eq!(
        b.synced_version(&res, &cancel).await.unwrap().as_deref(),
        Some("v2")
    );
    holder.await.unwrap();
}

#[tokio::test]
async fn wait_returns_after_lease_expires() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let short = LockService::new(
        store.clone(),
        LeaseConfig {
            lease_duration: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
            call_timeout: Duration::from_secs(2),
        },
    );
    let res = resource_id("Order", "relational");
    let cancel = CancellationToken::new();
    assert!(matches!(
        short.obtain_lock(&res, &cancel).await.unwrap(),
        Lock::Obtained(_)
    ));

    // holder never releases
    let waiter = LockService::new(store, fast_cfg());
    let state = waiter.wait_for_lock_dissolved(&res, &cancel).await.unwrap();
    assert_eq!(state, LockState::Available);
}

#[tokio::test]
async fn wait_is_cancellable() {
    let (a, b) = services(Arc::new(MemLeaseStore::new()));
    let res = resource_id("Order", "relational");
    let _held = a.obtain_lock(&res, &CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = b.wait_for_lock_dissolved(&res, &cancel).await.unwrap_err();
    assert!(matches!(err, LockError::Cancelled));
}

#[tokio::test]
async fn broken_lease_is_reported_and_reacquirable() {
    let (a, b) = services(Arc::new(SqliteLeaseStore::in_memory().unwrap()));
    let res = resource_id("Order", "logworkspace");
    let cancel = CancellationToken::new();
    let Lock::Obtained(stale) = a.obtain_lock(&res, &cancel).await.unwrap() else {
        panic!("expected lock");
    };

    assert!(
        b.break_lock(&res, Duration::from_millis(20), &cancel)
            .await
            .unwrap()
    );
    let state = b.wait_for_lock_dissolved(&res, &cancel).await.unwrap();
    assert_eq!(state, LockState::Broken);

    assert!(matches!(
        b.obtain_lock(&res, &cancel).await.unwrap(),
        Lock::Obtained(_)
    ));
    assert!(matches!(
        a.release_lock(&res, &stale, "v-old", &cancel).await,
        Err(LockError::LeaseLost { .. })
    ));
}

/// Never answers.
struct HungStore;

#[async_trait]
impl LeaseStore for HungStore {
    async fn create_marker(&self, _: &str) -> LockResult<()> {
        std::future::pending().await
    }
    async fn try_acquire(
        &self,
        _: &str,
        _: Duration,
    ) -> LockResult<Option<LeaseToken>> {
        std::future::pending().await
    }
    async fn properties(&self, _: &str) -> LockResult<Option<LeaseRecord>> {
        std::future::pending().await
    }
    async fn release(
        &self,
        _: &str,
        _: &LeaseToken,
        _: Option<&BTreeMap<String, String>>,
    ) -> LockResult<()> {
        std::future::pending().await
    }
    async fn break_lease(&self, _: &str, _: Duration) -> LockResult<bool> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn hung_store_call_times_out() {
    let locks = LockService::new(
        Arc::new(HungStore),
        LeaseConfig {
            call_timeout: Duration::from_millis(20),
            ..fast_cfg()
        },
    );
    let cancel = CancellationToken::new();

    let err = locks
        .obtain_lock("Order-relational", &cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, LockError::Timeout { action } if action == "try_acquire"),
        "{err}"
    );
    assert!(matches!(
        locks.synced_version("Order-relational", &cancel).await,
        Err(LockError::Timeout { .. })
    ));
}

#[tokio::test]
async fn hung_store_call_observes_cancellation() {
    let locks = LockService::new(Arc::new(HungStore), fast_cfg());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = locks
        .wait_for_lock_dissolved("Order-relational", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
}
