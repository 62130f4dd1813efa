//! Scheduler reconciler for unit placement.
//!
//! A pass reads units, machines and placements, then:
//! - Releases placements whose unit is gone or whose target is `inactive`
//! - Places every unit that wants a placement and has none, or whose machine
//!   has left the cluster
//! - Leaves units with no eligible machine unscheduled
//!
//! Machine choice is a pure function of the snapshot ([`select_machine`]):
//! requirement filter, conflict filter in both directions, then fewest placed
//! units with ties broken by machine ID.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_coord::LeaseGuard;
use fleet_id::{MachineId, UnitName};
use fleet_registry::signing::verify_unit;
use fleet_registry::{
    ClusterVersion, Machine, PayloadVerifier, Placement, RegistryError, SchedulerRegistry, Unit,
};
use tracing::{debug, info, instrument, warn};

use super::constraints::{declares_conflict, requirements_satisfied, units_conflict};
use crate::error::{EngineError, EngineResult};

/// Point-in-time view of the cluster used for placement decisions.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub units: BTreeMap<UnitName, Unit>,
    pub machines: BTreeMap<MachineId, Machine>,
    /// Placement records only; unscheduled units have no entry.
    pub placements: BTreeMap<UnitName, MachineId>,
}

impl ClusterSnapshot {
    pub fn new(units: Vec<Unit>, machines: Vec<Machine>, placements: Vec<Placement>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
            machines: machines.into_iter().map(|m| (m.id.clone(), m)).collect(),
            placements: placements
                .into_iter()
                .filter_map(|p| p.machine.map(|m| (p.unit, m)))
                .collect(),
        }
    }

    /// Read a fresh snapshot from the registry.
    pub async fn load(registry: &dyn SchedulerRegistry) -> EngineResult<Self> {
        let units = registry.list_units().await?;
        let machines = registry.list_machines().await?;
        let placements = registry.list_placements().await?;
        Ok(Self::new(units, machines, placements))
    }

    /// Units placed on `machine`.
    pub fn units_on<'a>(
        &'a self,
        machine: &'a MachineId,
    ) -> impl Iterator<Item = &'a UnitName> + 'a {
        self.placements
            .iter()
            .filter(move |(_, m)| *m == machine)
            .map(|(u, _)| u)
    }

    /// Returns true if `unit` is placed on a registered machine.
    pub fn is_placed(&self, unit: &UnitName) -> bool {
        self.placements
            .get(unit)
            .is_some_and(|m| self.machines.contains_key(m))
    }

    fn assign(&mut self, unit: UnitName, machine: MachineId) {
        self.placements.insert(unit, machine);
    }

    fn unassign(&mut self, unit: &UnitName) {
        self.placements.remove(unit);
    }
}

/// Placement decision for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Claim a placement on this machine.
    Assign(MachineId),
    /// No registered machine satisfies requirements and conflicts.
    Unsatisfiable,
    /// A verifier is configured and the unit signature does not verify.
    Rejected,
}

/// Pick the machine for `unit`, or `None` if no machine is eligible.
///
/// Deterministic for a fixed snapshot.
pub fn select_machine(unit: &Unit, snapshot: &ClusterSnapshot) -> Option<MachineId> {
    snapshot
        .machines
        .values()
        .filter(|machine| requirements_satisfied(&unit.requirements, &machine.metadata))
        .filter(|machine| !conflicts_on(unit, &machine.id, snapshot))
        .map(|machine| {
            let load = snapshot
                .units_on(&machine.id)
                .filter(|placed| **placed != unit.name)
                .count();
            (load, &machine.id)
        })
        .min()
        .map(|(_, id)| id.clone())
}

fn conflicts_on(unit: &Unit, machine: &MachineId, snapshot: &ClusterSnapshot) -> bool {
    snapshot
        .units_on(machine)
        .filter(|placed| **placed != unit.name)
        .any(|placed| match snapshot.units.get(placed) {
            Some(other) => units_conflict(unit, other),
            None => declares_conflict(unit, placed.as_str()),
        })
}

/// Statistics from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub units_evaluated: u32,
    pub placements_claimed: u32,
    pub placements_released: u32,
    pub unsatisfiable: u32,
    pub rejected: u32,
    /// Claims lost to a concurrent writer.
    pub claim_conflicts: u32,
    /// The pass was skipped because the cluster runs a newer version.
    pub skipped: bool,
}

impl ReconcileStats {
    /// Returns true if the pass wrote anything.
    pub fn changed(&self) -> bool {
        self.placements_claimed > 0 || self.placements_released > 0
    }
}

/// The scheduler reconciler.
pub struct SchedulerReconciler {
    registry: Arc<dyn SchedulerRegistry>,
    verifier: Option<Arc<dyn PayloadVerifier>>,
    version: ClusterVersion,
}

impl SchedulerReconciler {
    /// Create a new scheduler reconciler.
    pub fn new(registry: Arc<dyn SchedulerRegistry>, version: ClusterVersion) -> Self {
        Self {
            registry,
            verifier: None,
            version,
        }
    }

    /// Only schedule units whose signature verifies.
    pub fn with_verifier(mut self, verifier: Arc<dyn PayloadVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Decide where `unit` goes.
    pub fn decide(&self, unit: &Unit, snapshot: &ClusterSnapshot) -> Decision {
        if let Some(verifier) = &self.verifier {
            if !verify_unit(verifier.as_ref(), unit) {
                return Decision::Rejected;
            }
        }
        match select_machine(unit, snapshot) {
            Some(machine) => Decision::Assign(machine),
            None => Decision::Unsatisfiable,
        }
    }

    /// Run a single reconciliation pass.
    ///
    /// `guard` is checked before every write; once it lapses the pass stops
    /// with [`EngineError::LeadershipLost`].
    #[instrument(skip(self, guard))]
    pub async fn reconcile(&self, guard: &LeaseGuard) -> EngineResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        ensure_leader(guard)?;

        if let Some(cluster) = self.registry.latest_version().await? {
            if cluster > self.version {
                warn!(
                    cluster_version = %cluster,
                    engine_version = %self.version,
                    "Cluster runs a newer version, skipping pass"
                );
                stats.skipped = true;
                return Ok(stats);
            }
        }

        let mut snapshot = ClusterSnapshot::load(self.registry.as_ref()).await?;
        debug!(
            units = snapshot.units.len(),
            machines = snapshot.machines.len(),
            placements = snapshot.placements.len(),
            "Loaded cluster snapshot"
        );

        self.release_unwanted(&mut snapshot, guard, &mut stats)
            .await?;

        let pending: Vec<UnitName> = snapshot
            .units
            .values()
            .filter(|u| u.target_state.wants_placement() && !snapshot.is_placed(&u.name))
            .map(|u| u.name.clone())
            .collect();

        for name in pending {
            stats.units_evaluated += 1;
            self.schedule_unit(&name, &mut snapshot, guard, &mut stats)
                .await?;
        }

        if stats.changed() {
            info!(
                units_evaluated = stats.units_evaluated,
                placements_claimed = stats.placements_claimed,
                placements_released = stats.placements_released,
                unsatisfiable = stats.unsatisfiable,
                "Reconciliation pass complete"
            );
        }

        Ok(stats)
    }

    /// Release placements of destroyed units and of units targeting `inactive`.
    async fn release_unwanted(
        &self,
        snapshot: &mut ClusterSnapshot,
        guard: &LeaseGuard,
        stats: &mut ReconcileStats,
    ) -> EngineResult<()> {
        let unwanted: Vec<UnitName> = snapshot
            .placements
            .keys()
            .filter(|name| {
                snapshot
                    .units
                    .get(*name)
                    .is_none_or(|u| !u.target_state.wants_placement())
            })
            .cloned()
            .collect();

        for name in unwanted {
            ensure_leader(guard)?;
            self.registry.release_placement(&name).await?;
            snapshot.unassign(&name);
            stats.placements_released += 1;
            debug!(unit = %name, "Released unwanted placement");
        }
        Ok(())
    }

    async fn schedule_unit(
        &self,
        name: &UnitName,
        snapshot: &mut ClusterSnapshot,
        guard: &LeaseGuard,
        stats: &mut ReconcileStats,
    ) -> EngineResult<()> {
        // Re-evaluated once after losing a claim race.
        for attempt in 0..2 {
            let Some(unit) = snapshot.units.get(name) else {
                return Ok(());
            };
            if snapshot.is_placed(name) {
                return Ok(());
            }

            let machine = match self.decide(unit, snapshot) {
                Decision::Assign(machine) => machine,
                Decision::Rejected => {
                    warn!(unit = %name, "Unit signature missing or invalid, not scheduling");
                    stats.rejected += 1;
                    return self.release_stale(name, snapshot, guard, stats).await;
                }
                Decision::Unsatisfiable => {
                    info!(unit = %name, "No eligible machine, unit left unscheduled");
                    stats.unsatisfiable += 1;
                    return self.release_stale(name, snapshot, guard, stats).await;
                }
            };

            ensure_leader(guard)?;
            match self.registry.claim_placement(name, &machine).await {
                Ok(_) => {
                    info!(unit = %name, machine = %machine, "Unit scheduled");
                    snapshot.assign(name.clone(), machine);
                    stats.placements_claimed += 1;
                    return Ok(());
                }
                Err(RegistryError::AlreadyScheduled { machine: holder, .. }) => {
                    debug!(unit = %name, holder = %holder, attempt, "Claim lost, refreshing snapshot");
                    stats.claim_conflicts += 1;
                    *snapshot = ClusterSnapshot::load(self.registry.as_ref()).await?;
                }
                Err(e) if e.is_not_found() => {
                    debug!(unit = %name, machine = %machine, error = %e, "Claim target vanished, refreshing snapshot");
                    *snapshot = ClusterSnapshot::load(self.registry.as_ref()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Release a placement left on a departed machine so the unit reads as
    /// unscheduled.
    async fn release_stale(
        &self,
        name: &UnitName,
        snapshot: &mut ClusterSnapshot,
        guard: &LeaseGuard,
        stats: &mut ReconcileStats,
    ) -> EngineResult<()> {
        if !snapshot.placements.contains_key(name) {
            return Ok(());
        }
        ensure_leader(guard)?;
        self.registry.release_placement(name).await?;
        snapshot.unassign(name);
        stats.placements_released += 1;
        Ok(())
    }
}

fn ensure_leader(guard: &LeaseGuard) -> EngineResult<()> {
    if guard.is_valid() {
        Ok(())
    } else {
        Err(EngineError::LeadershipLost)
    }
}
