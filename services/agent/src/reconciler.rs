//! Reconciliation loop for converging local units.
//!
//! The reconciler:
//! - Reads the placements targeting this machine and their units
//! - Drives each unit through `loading → loaded → launching → launched`
//!   (or back down) with the local runtime, reporting every transition
//! - Stops units that are no longer placed here
//! - Polls runtime status of launched units

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{MachineId, UnitName};
use fleet_reconcile::{retry, ConvergenceStatus, RetryPolicy, RetryTracker, DEFAULT_RETRY_WINDOW};
use fleet_registry::{
    AgentRegistry, Placement, ProcessStatus, RegistryError, RegistryEvent, RegistryResult,
    RegistryWatch, ReportOutcome, TargetState, Unit, UnitState,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::runtime::UnitRuntime;
use crate::units::{LocalUnit, UnitManager};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between full passes.
    pub reconcile_interval: Duration,

    /// Interval between health checks.
    pub health_check_interval: Duration,

    /// Bounds on each runtime state report.
    pub report_retry: RetryPolicy,

    /// Failed reports per unit before a reconciliation error is raised.
    pub max_report_failures: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            report_retry: RetryPolicy::default(),
            max_report_failures: fleet_reconcile::DEFAULT_MAX_RETRIES,
        }
    }
}

impl From<&AgentConfig> for ReconcilerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
            health_check_interval: config.health_check_interval,
            report_retry: config.report_retry.clone(),
            ..Self::default()
        }
    }
}

/// Reconciler for converging the units placed on this machine.
pub struct AgentReconciler {
    registry: Arc<dyn AgentRegistry>,
    runtime: Arc<dyn UnitRuntime>,
    units: Arc<UnitManager>,
    machine: MachineId,
    config: ReconcilerConfig,

    /// Report failures per unit within the retry window.
    report_failures: Mutex<RetryTracker>,
}

impl AgentReconciler {
    /// Create a new reconciler.
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        runtime: Arc<dyn UnitRuntime>,
        units: Arc<UnitManager>,
        machine: MachineId,
        config: ReconcilerConfig,
    ) -> Self {
        let tracker = RetryTracker::new(config.max_report_failures, DEFAULT_RETRY_WINDOW);
        Self {
            registry,
            runtime,
            units,
            machine,
            config,
            report_failures: Mutex::new(tracker),
        }
    }

    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn units(&self) -> &Arc<UnitManager> {
        &self.units
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// A notification on `resync` forces a full pass.
    pub async fn run(&self, resync: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        info!(
            machine = %self.machine,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            health_check_interval_secs = self.config.health_check_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut watch = self.open_watch().await;
        let mut reconcile_interval = tokio::time::interval(self.config.reconcile_interval);
        let mut health_check_interval = tokio::time::interval(self.config.health_check_interval);

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    if watch.is_none() {
                        watch = self.open_watch().await;
                    }
                    self.run_pass().await;
                }
                _ = health_check_interval.tick() => {
                    self.check_health().await;
                }
                event = next_event(&mut watch), if watch.is_some() => {
                    match event {
                        Ok(Some(event)) => {
                            if self.is_relevant(&event).await {
                                debug!(?event, "Registry change");
                                self.run_pass().await;
                            }
                        }
                        Ok(None) => {
                            warn!("Registry watch closed");
                            watch = None;
                        }
                        Err(e) => {
                            warn!(error = %e, "Registry watch failed, reopening");
                            watch = self.open_watch().await;
                        }
                    }
                }
                _ = resync.notified() => {
                    info!("Machine re-registered, running full reconcile");
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn open_watch(&self) -> Option<RegistryWatch> {
        match self.registry.watch().await {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!(error = %e, "Failed to open registry watch");
                None
            }
        }
    }

    async fn run_pass(&self) {
        match self.reconcile().await {
            Ok(status) => debug!(?status, "Reconciliation pass complete"),
            Err(e) => error!(error = %e, "Reconciliation failed"),
        }
    }

    /// Returns true if `event` may change what this machine should run.
    async fn is_relevant(&self, event: &RegistryEvent) -> bool {
        match event {
            RegistryEvent::Resync | RegistryEvent::UnitChanged(_) => true,
            RegistryEvent::UnitRemoved(name) | RegistryEvent::PlacementReleased(name) => {
                self.units.contains(name).await
            }
            RegistryEvent::PlacementChanged(placement) if placement.is_on(&self.machine) => {
                // Skip the echo of our own report.
                match self.units.get(&placement.unit).await {
                    Some(local) => local.last_reported_state != Some(placement.state),
                    None => true,
                }
            }
            RegistryEvent::PlacementChanged(placement) => {
                self.units.contains(&placement.unit).await
            }
            _ => false,
        }
    }

    /// Perform a single reconciliation pass.
    #[instrument(skip(self), fields(machine = %self.machine))]
    pub async fn reconcile(&self) -> AgentResult<ConvergenceStatus> {
        debug!("Starting reconciliation");

        let placements = self.registry.list_placements().await?;
        let units = self.registry.list_units().await?;

        let desired: Vec<(Placement, Unit)> = placements
            .into_iter()
            .filter(|p| p.is_on(&self.machine))
            .filter_map(|p| {
                let unit = units.iter().find(|u| u.name == p.unit)?.clone();
                Some((p, unit))
            })
            .collect();

        // Stop units that are no longer placed here
        for name in self.units.names().await {
            if !desired.iter().any(|(_, unit)| unit.name == name) {
                self.retire(&name).await;
            }
        }

        let mut status = ConvergenceStatus::Converged;
        for (placement, unit) in &desired {
            match unit.target_state {
                TargetState::Launched => self.launch(unit).await,
                TargetState::Loaded => self.load(unit).await,
                TargetState::Inactive => self.deactivate(placement, unit).await,
            }

            let unit_status = match self.units.get(&unit.name).await {
                Some(local) if local.state == UnitState::Failed => ConvergenceStatus::Diverged,
                Some(local) if local.needs_status_report() => ConvergenceStatus::Converging,
                Some(local) if !local.state.satisfies(unit.target_state) => {
                    ConvergenceStatus::Converging
                }
                _ => ConvergenceStatus::Converged,
            };
            status = worst(status, unit_status);
        }

        self.report_failures.lock().await.prune();
        Ok(status)
    }

    /// Drive `unit` to `launched`.
    async fn launch(&self, unit: &Unit) {
        let previous = self.units.get(&unit.name).await;
        let local = self.units.track(unit).await;

        if local.is_failed_at(unit) {
            self.flush(&local).await;
            return;
        }

        if local.state == UnitState::Launched {
            let redefined = previous.is_some_and(|p| p.unit.definition != unit.definition);
            if !redefined {
                self.flush(&local).await;
                return;
            }
            info!(unit = %unit.name, "Unit definition changed, restarting");
            self.stop_process(&unit.name).await;
            self.step(&unit.name, UnitState::Loaded, ProcessStatus::Stopped, None)
                .await;
        } else if local.state != UnitState::Loaded {
            if local.state == UnitState::Failed {
                debug!(unit = %unit.name, revision = unit.revision, "Retrying failed unit at new revision");
                self.stop_process(&unit.name).await;
            }
            self.stage(&unit.name).await;
        }

        self.step(&unit.name, UnitState::Launching, ProcessStatus::Starting, None)
            .await;
        match self.runtime.start(unit).await {
            Ok(()) => {
                info!(unit = %unit.name, "Unit launched");
                self.step(&unit.name, UnitState::Launched, ProcessStatus::Running, None)
                    .await;
            }
            Err(e) => {
                let err = AgentError::runtime(&unit.name, &e);
                error!(unit = %unit.name, revision = unit.revision, error = %err, "Failed to start unit");
                self.step(
                    &unit.name,
                    UnitState::Failed,
                    ProcessStatus::Failed,
                    Some(e.to_string()),
                )
                .await;
            }
        }
    }

    /// Drive `unit` to `loaded`, stopping it if running.
    async fn load(&self, unit: &Unit) {
        let local = self.units.track(unit).await;
        match local.state {
            UnitState::Loaded => self.flush(&local).await,
            UnitState::Launching | UnitState::Launched | UnitState::Failed => {
                info!(unit = %unit.name, "Stopping unit, target is loaded");
                self.stop_process(&unit.name).await;
                self.step(&unit.name, UnitState::Loaded, ProcessStatus::Stopped, None)
                    .await;
            }
            UnitState::Inactive | UnitState::Loading => self.stage(&unit.name).await,
        }
    }

    /// Stop `unit`, report `inactive` and drop its runtime record.
    async fn deactivate(&self, placement: &Placement, unit: &Unit) {
        let tracked = self.units.contains(&unit.name).await;
        if !tracked && placement.state == UnitState::Inactive {
            return;
        }

        info!(unit = %unit.name, "Deactivating unit");
        self.stop_process(&unit.name).await;
        self.units.track(unit).await;
        self.step(&unit.name, UnitState::Inactive, ProcessStatus::Stopped, None)
            .await;

        let pending = self
            .units
            .get(&unit.name)
            .await
            .is_some_and(|local| local.needs_status_report());
        if !pending {
            self.clear_runtime(&unit.name).await;
            self.units.remove(&unit.name).await;
        }
    }

    /// Stop a unit that is no longer placed on this machine.
    async fn retire(&self, name: &UnitName) {
        info!(unit = %name, "Unit no longer placed here, stopping");
        self.stop_process(name).await;
        self.clear_runtime(name).await;
        self.units.remove(name).await;
        self.report_failures.lock().await.clear(name.as_str());
    }

    /// Move through `loading` to `loaded`.
    async fn stage(&self, name: &UnitName) {
        self.step(name, UnitState::Loading, ProcessStatus::Stopped, None)
            .await;
        self.step(name, UnitState::Loaded, ProcessStatus::Stopped, None)
            .await;
    }

    /// Record a transition and report it.
    async fn step(
        &self,
        name: &UnitName,
        state: UnitState,
        status: ProcessStatus,
        message: Option<String>,
    ) {
        if !self.units.transition(name, state, status, message).await {
            return;
        }
        debug!(unit = %name, %state, %status, "Unit transition");
        if let Some(local) = self.units.get(name).await {
            self.report(&local).await;
        }
    }

    /// Re-send the current state if its last report did not land.
    async fn flush(&self, local: &LocalUnit) {
        if local.needs_status_report() {
            self.report(local).await;
        }
    }

    async fn stop_process(&self, name: &UnitName) {
        if let Err(e) = self.runtime.stop(name).await {
            let err = AgentError::runtime(name, &e);
            warn!(unit = %name, error = %err, "Failed to stop unit");
        }
    }

    /// Report the state of `local`. `Stale` outcomes count as delivered.
    async fn report(&self, local: &LocalUnit) {
        let name = &local.unit.name;
        let registry = &self.registry;
        let machine = &self.machine;
        let result = retry(
            "report_runtime_state",
            &self.config.report_retry,
            RegistryError::is_unavailable,
            move || {
                registry.report_runtime_state(
                    name,
                    machine,
                    local.state,
                    local.status,
                    local.message.clone(),
                )
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                if outcome == ReportOutcome::Stale {
                    debug!(unit = %name, state = %local.state, "Placement moved, report dropped");
                }
                self.units.mark_reported(name, local.state).await;
                self.report_failures.lock().await.clear(name.as_str());
            }
            Err(e) => self.record_report_failure(name, local.state, &e).await,
        }
    }

    async fn record_report_failure(&self, name: &UnitName, state: UnitState, e: &RegistryError) {
        let mut tracker = self.report_failures.lock().await;
        let already_exhausted = tracker.is_exhausted(name.as_str());
        let exhausted = tracker.record_failure(name.as_str());

        if exhausted && !already_exhausted {
            let err = AgentError::Reconciliation {
                unit: name.clone(),
                reason: format!("could not report state {state}: {e}"),
            };
            error!(unit = %name, error = %err, "Giving up on unit state report until next window");
        } else {
            warn!(unit = %name, %state, error = %e, "Failed to report unit state, will retry");
        }
    }

    async fn clear_runtime(&self, name: &UnitName) {
        let registry = &self.registry;
        let machine = &self.machine;
        let result: RegistryResult<bool> = retry(
            "clear_runtime_state",
            &self.config.report_retry,
            RegistryError::is_unavailable,
            move || registry.clear_runtime_state(name, machine),
        )
        .await;
        if let Err(e) = result {
            warn!(unit = %name, error = %e, "Failed to clear runtime state");
        }
    }

    /// Poll runtime status of launched units; report those that died.
    pub async fn check_health(&self) {
        debug!("Checking unit health");

        for local in self.units.list().await {
            if local.state != UnitState::Launched {
                continue;
            }
            let name = &local.unit.name;
            match self.runtime.status(name).await {
                Ok(ProcessStatus::Failed) => {
                    warn!(unit = %name, "Unit process failed");
                    self.step(
                        name,
                        UnitState::Failed,
                        ProcessStatus::Failed,
                        Some("process failed".to_string()),
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => {
                    let err = AgentError::runtime(name, &e);
                    warn!(unit = %name, error = %err, "Failed to check unit status");
                }
            }
        }
    }
}

fn worst(a: ConvergenceStatus, b: ConvergenceStatus) -> ConvergenceStatus {
    fn rank(status: ConvergenceStatus) -> u8 {
        match status {
            ConvergenceStatus::Converged => 0,
            ConvergenceStatus::Unknown => 1,
            ConvergenceStatus::Converging => 2,
            ConvergenceStatus::Diverged => 3,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

async fn next_event(watch: &mut Option<RegistryWatch>) -> RegistryResult<Option<RegistryEvent>> {
    match watch {
        Some(watch) => watch.next().await,
        None => pending().await,
    }
}
