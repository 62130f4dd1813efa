//! Registry writes that interleave with other writers or partial store failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_coord::{
    CoordError, CoordResult, Index, KeyValue, LeaseId, MemoryStore, Precondition, Snapshot, Store,
    WatchEvent,
};
use fleet_id::{MachineId, UnitName};
use fleet_registry::{Machine, Registry, RegistryConfig, TargetState, Unit};
use tokio::sync::{broadcast, Notify};

/// Pauses one conditional write on a key until released.
struct Hold {
    key: String,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

/// Memory store with a one-shot write hold and failing deletes under a prefix.
#[derive(Default)]
struct InterleavedStore {
    inner: MemoryStore,
    hold: Mutex<Option<Hold>>,
    failing_deletes: Mutex<Option<String>>,
}

impl InterleavedStore {
    /// Returns `(reached, release)`: `reached` fires once a CAS on `key` is
    /// pending, and the CAS proceeds after `release` is notified.
    fn hold_cas(&self, key: String) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(Hold {
            key,
            reached: reached.clone(),
            release: release.clone(),
        });
        (reached, release)
    }

    fn fail_deletes_under(&self, prefix: String) {
        *self.failing_deletes.lock().unwrap() = Some(prefix);
    }

    fn take_hold(&self, key: &str) -> Option<Hold> {
        let mut hold = self.hold.lock().unwrap();
        match hold.as_ref() {
            Some(h) if h.key == key => hold.take(),
            _ => None,
        }
    }

    fn delete_fails(&self, key: &str) -> bool {
        self.failing_deletes
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix))
    }
}

#[async_trait]
impl Store for InterleavedStore {
    async fn get(&self, key: &str) -> CoordResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> CoordResult<Snapshot> {
        self.inner.list(prefix).await
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> CoordResult<Index> {
        self.inner.put(key, value, lease).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Precondition,
        value: String,
        lease: Option<LeaseId>,
    ) -> CoordResult<Index> {
        if let Some(hold) = self.take_hold(key) {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        self.inner.compare_and_swap(key, expected, value, lease).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<Index> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn delete(&self, key: &str) -> CoordResult<bool> {
        if self.delete_fails(key) {
            return Err(CoordError::Unavailable("delete rejected".to_string()));
        }
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> CoordResult<usize> {
        self.inner.delete_prefix(prefix).await
    }

    async fn grant_lease(&self, ttl: Duration) -> CoordResult<LeaseId> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordResult<()> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> CoordResult<()> {
        self.inner.revoke_lease(lease).await
    }

    fn subscribe(&self) -> CoordResult<broadcast::Receiver<WatchEvent>> {
        self.inner.subscribe()
    }
}

fn setup() -> (Arc<InterleavedStore>, Arc<Registry>) {
    let store = Arc::new(InterleavedStore::default());
    let registry = Arc::new(Registry::new(store.clone(), RegistryConfig::default()));
    (store, registry)
}

#[tokio::test]
async fn test_set_target_state_does_not_resurrect_destroyed_unit() {
    let (store, registry) = setup();
    let name = UnitName::parse("web.service").unwrap();
    registry
        .create_unit(&Unit::new(name.clone(), "ExecStart=/bin/web"))
        .await
        .unwrap();

    let (reached, release) = store.hold_cas(registry.keys().unit(&name));
    let setter = {
        let registry = registry.clone();
        let name = name.clone();
        tokio::spawn(async move { registry.set_target_state(&name, TargetState::Loaded).await })
    };

    reached.notified().await;
    assert!(registry.destroy_unit(&name).await.unwrap());
    release.notify_one();

    let err = setter.await.unwrap().unwrap_err();
    assert!(err.is_not_found());
    assert!(registry.unit(&name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_target_state_retries_after_concurrent_write() {
    let (store, registry) = setup();
    let name = UnitName::parse("web.service").unwrap();
    registry
        .create_unit(&Unit::new(name.clone(), "ExecStart=/bin/web"))
        .await
        .unwrap();

    let (reached, release) = store.hold_cas(registry.keys().unit(&name));
    let setter = {
        let registry = registry.clone();
        let name = name.clone();
        tokio::spawn(async move { registry.set_target_state(&name, TargetState::Loaded).await })
    };

    reached.notified().await;
    registry
        .set_target_state(&name, TargetState::Inactive)
        .await
        .unwrap();
    release.notify_one();

    // The held writer re-reads and still lands last.
    let revision = setter.await.unwrap().unwrap();
    let stored = registry.unit(&name).await.unwrap().unwrap();
    assert_eq!(stored.target_state, TargetState::Loaded);
    assert_eq!(stored.revision, revision);
}

#[tokio::test(start_paused = true)]
async fn test_claim_succeeds_when_stale_runtime_cleanup_fails() {
    let (store, registry) = setup();
    let name = UnitName::parse("web.service").unwrap();
    registry
        .create_unit(&Unit::new(name.clone(), "ExecStart=/bin/web"))
        .await
        .unwrap();

    let m1 = MachineId::parse("m1").unwrap();
    let m2 = MachineId::parse("m2").unwrap();
    let _short = registry
        .register_machine(&Machine::new(m1.clone()), Duration::from_secs(5))
        .await
        .unwrap();
    registry.claim_placement(&name, &m1).await.unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    let _long = registry
        .register_machine(&Machine::new(m2.clone()), Duration::from_secs(60))
        .await
        .unwrap();

    store.fail_deletes_under(registry.keys().runtime_of(&name));
    let placement = registry.claim_placement(&name, &m2).await.unwrap();
    assert!(placement.is_on(&m2));
    assert!(registry.placement(&name).await.unwrap().is_on(&m2));
}
