//! End-to-end cluster scenarios.
//!
//! Each test runs a whole cluster in-process on paused time: an in-memory
//! store with its lease reaper, scheduling engine candidates and one agent
//! per machine with a mock runtime. Scenarios covered:
//!
//! 1. A unit submitted to two idle machines lands on the first and launches
//! 2. A machine whose lease expires loses its units to the survivors
//! 3. Mutually conflicting units never share a machine
//! 4. Destroying a unit is idempotent and stops it on its machine
//! 5. Placements settle and stay put across sweeps
//! 6. A standby engine takes over when the leader shuts down
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test scenarios
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::{
    run_heartbeat_loop, AgentConfig, AgentReconciler, MockRuntime, ReconcilerConfig, UnitManager,
};
use fleet_coord::MemoryStore;
use fleet_engine::{EngineConfig, EngineState, SchedulerWorker};
use fleet_id::{MachineId, UnitName};
use fleet_registry::{
    Machine, Placement, Registry, RegistryConfig, ScheduleStatus, Submitter, Unit, UnitState,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(500);
const POLL_ATTEMPTS: u32 = 240;

struct AgentHandle {
    runtime: Arc<MockRuntime>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineHandle {
    worker: Arc<SchedulerWorker>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Cluster {
    registry: Arc<Registry>,
    submitter: Submitter,
    reaper: JoinHandle<()>,
    agents: BTreeMap<String, AgentHandle>,
    engines: Vec<EngineHandle>,
}

impl Cluster {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let reaper = store.spawn_reaper(Duration::from_secs(1));
        let registry = Arc::new(Registry::new(store, RegistryConfig::default()));
        Self {
            submitter: Submitter::new(registry.clone()),
            registry,
            reaper,
            agents: BTreeMap::new(),
            engines: Vec::new(),
        }
    }

    /// Start an agent and wait for its machine record.
    async fn add_machine(&mut self, machine: Machine) {
        let id = machine.id.clone();
        let mut config = AgentConfig::new(id.clone());
        config.metadata = machine.metadata;
        config.lease_ttl = Duration::from_secs(9);
        config.heartbeat_interval = Duration::from_secs(3);
        config.reconcile_interval = Duration::from_secs(10);
        config.health_check_interval = Duration::from_secs(5);

        let runtime = Arc::new(MockRuntime::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let resync = Arc::new(Notify::new());

        // Loops spawned separately so a crash can drop the lease unreleased.
        let heartbeat = tokio::spawn({
            let registry = self.registry.clone();
            let config = config.clone();
            let resync = resync.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                let _ = run_heartbeat_loop(registry, config, resync, shutdown_rx).await;
            }
        });
        let reconciler = Arc::new(AgentReconciler::new(
            self.registry.clone(),
            runtime.clone(),
            Arc::new(UnitManager::new()),
            id.clone(),
            ReconcilerConfig::from(&config),
        ));
        let reconciler = tokio::spawn(async move { reconciler.run(resync, shutdown_rx).await });

        self.agents.insert(
            id.to_string(),
            AgentHandle {
                runtime,
                shutdown,
                tasks: vec![heartbeat, reconciler],
            },
        );

        for _ in 0..POLL_ATTEMPTS {
            if self.registry.machine(&id).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("machine {id} never registered");
    }

    fn add_engine(&mut self) {
        let config = EngineConfig {
            lease_ttl: Duration::from_secs(6),
            renew_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(15),
            ..EngineConfig::default()
        };
        let worker = Arc::new(SchedulerWorker::new(self.registry.clone(), config));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        };
        self.engines.push(EngineHandle {
            worker,
            shutdown,
            task,
        });
    }

    /// Simulate a machine dying: loops stop and the lease is left to expire.
    fn crash_machine(&self, id: &str) {
        let agent = self.agents.get(id).expect("unknown machine");
        for task in &agent.tasks {
            task.abort();
        }
    }

    fn runtime(&self, id: &str) -> &MockRuntime {
        &self.agents[id].runtime
    }

    async fn submit(&self, unit: Unit) -> UnitName {
        self.submitter.submit(unit).await.unwrap().name
    }

    /// Poll until `name` is on `machine` in `state`.
    async fn wait_for(&self, name: &UnitName, machine: &str, state: UnitState) -> Placement {
        let machine = mid(machine);
        for _ in 0..POLL_ATTEMPTS {
            if let Ok(placement) = self.registry.placement(name).await {
                if placement.is_on(&machine) && placement.state == state {
                    return placement;
                }
            }
            tokio::time::sleep(POLL).await;
        }
        panic!(
            "{name} never reached {state} on {machine}: {:?}",
            self.registry.placement(name).await
        );
    }

    async fn wait_for_leader(&self, engine: usize) {
        let mut states = self.engines[engine].worker.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(60),
            states.wait_for(|s| *s != EngineState::Idle),
        )
        .await
        .expect("engine never became leader")
        .unwrap();
    }

    async fn holders(&self) -> BTreeMap<UnitName, Option<MachineId>> {
        self.registry
            .list_placements()
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.unit, p.machine))
            .collect()
    }

    async fn shutdown(self) {
        for agent in self.agents.values() {
            let _ = agent.shutdown.send(true);
        }
        for engine in &self.engines {
            let _ = engine.shutdown.send(true);
        }
        for agent in self.agents.into_values() {
            for task in agent.tasks {
                let _ = task.await;
            }
        }
        for engine in self.engines {
            let _ = engine.task.await;
        }
        self.reaper.abort();
    }
}

fn unit(name: &str) -> Unit {
    Unit::new(UnitName::parse(name).unwrap(), "ExecStart=/bin/true")
}

fn machine(id: &str) -> Machine {
    Machine::new(mid(id))
}

fn mid(id: &str) -> MachineId {
    MachineId::parse(id).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unit_lands_on_first_machine_and_launches() {
    let mut cluster = Cluster::new();
    cluster.add_machine(machine("m1")).await;
    cluster.add_machine(machine("m2")).await;
    cluster.add_engine();
    cluster.wait_for_leader(0).await;

    let name = cluster.submit(unit("web.service")).await;
    cluster.wait_for(&name, "m1", UnitState::Launched).await;

    assert!(cluster.runtime("m1").is_running(&name));
    assert!(cluster.runtime("m2").running().is_empty());

    let runtime = cluster.registry.runtime_states(&name).await.unwrap();
    assert_eq!(runtime.len(), 1);
    assert_eq!(runtime[0].machine, mid("m1"));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_machine_units_move_to_survivor() {
    let mut cluster = Cluster::new();
    cluster.add_machine(machine("m1")).await;
    cluster.add_machine(machine("m2")).await;
    cluster.add_engine();

    let name = cluster.submit(unit("web.service")).await;
    cluster.wait_for(&name, "m1", UnitState::Launched).await;

    cluster.crash_machine("m1");
    cluster.wait_for(&name, "m2", UnitState::Launched).await;

    assert!(cluster.registry.machine(&mid("m1")).await.unwrap().is_none());
    assert!(cluster.runtime("m2").is_running(&name));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_units_never_share_a_machine() {
    let mut cluster = Cluster::new();
    cluster.add_machine(machine("m1")).await;
    cluster.add_engine();
    cluster.wait_for_leader(0).await;

    let db = cluster.submit(unit("db.service").with_conflict("cache.*")).await;
    let cache = cluster.submit(unit("cache.service").with_conflict("db.*")).await;

    let results = cluster
        .submitter
        .wait_for_scheduled(&[db.clone(), cache.clone()], 5, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(results.values().filter(|s| s.is_scheduled()).count(), 1);
    assert!(results.values().any(|s| *s == ScheduleStatus::Queued));

    cluster.add_machine(machine("m2")).await;
    let results = cluster
        .submitter
        .wait_for_scheduled(&[db.clone(), cache.clone()], 30, Duration::from_secs(1))
        .await
        .unwrap();
    assert_ne!(results[&db], results[&cache]);
    assert!(results.values().all(ScheduleStatus::is_scheduled));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent_and_stops_unit() {
    let mut cluster = Cluster::new();
    cluster.add_machine(machine("m1")).await;
    cluster.add_engine();

    let name = cluster.submit(unit("web.service")).await;
    cluster.wait_for(&name, "m1", UnitState::Launched).await;

    assert!(cluster.submitter.destroy(&name).await.unwrap());
    assert!(!cluster.submitter.destroy(&name).await.unwrap());

    for _ in 0..POLL_ATTEMPTS {
        if !cluster.runtime("m1").is_running(&name) {
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    assert!(!cluster.runtime("m1").is_running(&name));
    assert!(cluster.registry.placement(&name).await.unwrap_err().is_not_found());
    assert!(cluster.registry.runtime_states(&name).await.unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_placements_settle_and_stay_put() {
    let mut cluster = Cluster::new();
    for id in ["m1", "m2", "m3"] {
        cluster.add_machine(machine(id)).await;
    }
    cluster.add_engine();
    cluster.wait_for_leader(0).await;

    let mut names = Vec::new();
    for i in 0..6 {
        names.push(cluster.submit(unit(&format!("app{i}.service"))).await);
    }
    let results = cluster
        .submitter
        .wait_for_scheduled(&names, 30, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(results.values().all(ScheduleStatus::is_scheduled));

    let settled = cluster.holders().await;
    let mut per_machine: BTreeMap<MachineId, usize> = BTreeMap::new();
    for machine in settled.values().flatten() {
        *per_machine.entry(machine.clone()).or_default() += 1;
    }
    assert_eq!(per_machine.values().copied().collect::<Vec<_>>(), vec![2, 2, 2]);

    // Several sweeps later nothing has moved.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(cluster.holders().await, settled);
    for name in &names {
        let placement = cluster.registry.placement(name).await.unwrap();
        assert_eq!(placement.state, UnitState::Launched);
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_standby_engine_takes_over() {
    let mut cluster = Cluster::new();
    cluster.add_machine(machine("m1")).await;
    cluster.add_engine();
    cluster.wait_for_leader(0).await;
    cluster.add_engine();

    let first = cluster.submit(unit("a.service")).await;
    cluster.wait_for(&first, "m1", UnitState::Launched).await;
    assert_eq!(cluster.engines[1].worker.state(), EngineState::Idle);

    let leader = cluster.engines.remove(0);
    leader.shutdown.send(true).unwrap();
    leader.task.await.unwrap();
    cluster.wait_for_leader(0).await;

    let second = cluster.submit(unit("b.service")).await;
    cluster.wait_for(&second, "m1", UnitState::Launched).await;

    cluster.shutdown().await;
}
