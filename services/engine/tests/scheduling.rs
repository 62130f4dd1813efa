//! Reconciler and worker behavior against an in-process registry.

use std::sync::Arc;
use std::time::Duration;

use fleet_coord::{LeaseHandle, MemoryStore, Store};
use fleet_engine::{EngineConfig, EngineError, EngineState, SchedulerReconciler, SchedulerWorker};
use fleet_id::{EngineId, MachineId, UnitName};
use fleet_registry::signing::sign_unit;
use fleet_registry::{
    ClusterVersion, DigestSigner, Machine, Registry, RegistryConfig, TargetState, Unit,
};
use tokio::sync::watch;

const TTL: Duration = Duration::from_secs(10);

struct Harness {
    registry: Arc<Registry>,
    leader: LeaseHandle,
}

impl Harness {
    async fn new() -> Self {
        let registry = Arc::new(Registry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
        ));
        let leader = registry
            .acquire_leadership(&EngineId::new(), TTL)
            .await
            .unwrap()
            .unwrap();
        Self { registry, leader }
    }

    fn reconciler(&self) -> SchedulerReconciler {
        SchedulerReconciler::new(self.registry.clone(), ClusterVersion::new(1, 0, 0))
    }

    /// Dropping the handle leaves the lease running until its TTL.
    async fn machine(&self, machine: Machine) {
        self.registry.register_machine(&machine, TTL).await.unwrap();
    }

    async fn unit(&self, unit: Unit) -> UnitName {
        self.registry.create_unit(&unit).await.unwrap().name
    }

    async fn holder(&self, name: &UnitName) -> Option<MachineId> {
        self.registry.placement(name).await.unwrap().machine
    }
}

fn unit(name: &str) -> Unit {
    Unit::new(UnitName::parse(name).unwrap(), "ExecStart=/bin/true")
}

fn machine(id: &str) -> Machine {
    Machine::new(MachineId::parse(id).unwrap())
}

fn mid(id: &str) -> MachineId {
    MachineId::parse(id).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_pass_spreads_units_and_converges() {
    let h = Harness::new().await;
    h.machine(machine("m1")).await;
    h.machine(machine("m2")).await;
    let a = h.unit(unit("a.service")).await;
    let b = h.unit(unit("b.service")).await;
    let c = h.unit(unit("c.service")).await;

    let reconciler = h.reconciler();
    let stats = reconciler.reconcile(&h.leader.guard()).await.unwrap();
    assert_eq!(stats.placements_claimed, 3);

    assert_eq!(h.holder(&a).await, Some(mid("m1")));
    assert_eq!(h.holder(&b).await, Some(mid("m2")));
    assert_eq!(h.holder(&c).await, Some(mid("m1")));

    let stats = reconciler.reconcile(&h.leader.guard()).await.unwrap();
    assert!(!stats.changed());
}

#[tokio::test(start_paused = true)]
async fn test_unsatisfiable_unit_stays_unscheduled() {
    let h = Harness::new().await;
    h.machine(machine("m1").with_metadata("region", "us-east")).await;
    let name = h
        .unit(unit("web.service").with_requirement("region", "eu-west"))
        .await;

    let stats = h.reconciler().reconcile(&h.leader.guard()).await.unwrap();
    assert_eq!(stats.unsatisfiable, 1);
    assert_eq!(h.holder(&name).await, None);

    h.machine(machine("m2").with_metadata("region", "eu-west")).await;
    h.reconciler().reconcile(&h.leader.guard()).await.unwrap();
    assert_eq!(h.holder(&name).await, Some(mid("m2")));
}

#[tokio::test(start_paused = true)]
async fn test_inactive_and_orphan_placements_are_released() {
    let h = Harness::new().await;
    h.machine(machine("m1")).await;
    let a = h.unit(unit("a.service")).await;
    let b = h.unit(unit("b.service")).await;

    let reconciler = h.reconciler();
    reconciler.reconcile(&h.leader.guard()).await.unwrap();

    h.registry
        .set_target_state(&a, TargetState::Inactive)
        .await
        .unwrap();
    // Unit record removed behind the registry's back leaves an orphan placement.
    h.registry
        .store()
        .delete(&h.registry.keys().unit(&b))
        .await
        .unwrap();

    let stats = reconciler.reconcile(&h.leader.guard()).await.unwrap();
    assert_eq!(stats.placements_released, 2);
    assert_eq!(h.holder(&a).await, None);
    assert_eq!(h.registry.list_placements().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_leadership_stops_writes() {
    let h = Harness::new().await;
    h.machine(machine("m1")).await;
    let name = h.unit(unit("a.service")).await;

    let guard = h.leader.guard();
    tokio::time::advance(TTL + Duration::from_secs(1)).await;

    let err = h.reconciler().reconcile(&guard).await.unwrap_err();
    assert!(matches!(err, EngineError::LeadershipLost));
    assert_eq!(h.holder(&name).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_newer_cluster_version_skips_pass() {
    let h = Harness::new().await;
    h.machine(machine("m1")).await;
    let name = h.unit(unit("a.service")).await;
    h.registry
        .set_latest_version(ClusterVersion::new(2, 0, 0))
        .await
        .unwrap();

    let stats = h.reconciler().reconcile(&h.leader.guard()).await.unwrap();
    assert!(stats.skipped);
    assert_eq!(h.holder(&name).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_unsigned_units_are_not_scheduled_with_verifier() {
    let h = Harness::new().await;
    h.machine(machine("m1")).await;
    let signer = Arc::new(DigestSigner::new("cluster-key"));

    let unsigned = h.unit(unit("a.service")).await;
    let mut signed = unit("b.service");
    sign_unit(signer.as_ref(), &mut signed);
    let signed = h.unit(signed).await;

    let stats = h
        .reconciler()
        .with_verifier(signer)
        .reconcile(&h.leader.guard())
        .await
        .unwrap();

    assert_eq!(stats.rejected, 1);
    assert_eq!(h.holder(&unsigned).await, None);
    assert_eq!(h.holder(&signed).await, Some(mid("m1")));
}

#[tokio::test(start_paused = true)]
async fn test_worker_elects_schedules_and_hands_over() {
    let registry = Arc::new(Registry::new(
        Arc::new(MemoryStore::new()),
        RegistryConfig::default(),
    ));
    registry
        .register_machine(&machine("m1"), Duration::from_secs(600))
        .await
        .unwrap();
    let name = registry.create_unit(&unit("web.service")).await.unwrap().name;

    let config = EngineConfig {
        lease_ttl: Duration::from_secs(6),
        renew_interval: Duration::from_secs(2),
        sweep_interval: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let worker = Arc::new(SchedulerWorker::new(registry.clone(), config.clone()));
    let mut states = worker.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    states
        .wait_for(|s| *s == EngineState::Watching)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        registry.placement(&name).await.unwrap().machine,
        Some(mid("m1"))
    );
    assert_eq!(
        registry.latest_version().await.unwrap(),
        Some(config.version)
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(registry.leader().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_worker_goes_idle_when_partitioned_past_ttl() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(store.clone(), RegistryConfig::default()));
    let config = EngineConfig {
        lease_ttl: Duration::from_secs(6),
        renew_interval: Duration::from_secs(2),
        sweep_interval: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let worker = Arc::new(SchedulerWorker::new(registry.clone(), config.clone()));
    let mut states = worker.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };
    states
        .wait_for(|s| *s == EngineState::Watching)
        .await
        .unwrap();

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(worker.state(), EngineState::Idle);

    // Another engine takes the expired lease as soon as the store is back.
    store.set_available(true);
    let other = registry
        .acquire_leadership(&EngineId::new(), Duration::from_secs(600))
        .await
        .unwrap();
    assert!(other.is_some());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(worker.state(), EngineState::Idle);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
