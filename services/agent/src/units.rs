//! Local unit table.
//!
//! The unit manager:
//! - Tracks the units this agent has acted on and their observed state
//! - Remembers the last state successfully reported to the registry
//! - Pins failed starts to the unit revision that failed

use std::collections::BTreeMap;

use fleet_coord::Index;
use fleet_id::UnitName;
use fleet_registry::{ProcessStatus, Unit, UnitState};
use tokio::sync::RwLock;

/// Tracks a single unit's local state.
#[derive(Debug, Clone)]
pub struct LocalUnit {
    pub unit: Unit,
    pub state: UnitState,
    pub status: ProcessStatus,
    pub message: Option<String>,
    pub last_reported_state: Option<UnitState>,

    /// Revision whose start failed. Not retried until the unit changes.
    pub failed_revision: Option<Index>,
}

impl LocalUnit {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            state: UnitState::Inactive,
            status: ProcessStatus::Stopped,
            message: None,
            last_reported_state: None,
            failed_revision: None,
        }
    }

    /// Check if state needs to be reported (transition detection).
    pub fn needs_status_report(&self) -> bool {
        self.last_reported_state != Some(self.state)
    }

    /// Mark current state as reported.
    pub fn mark_status_reported(&mut self) {
        self.last_reported_state = Some(self.state);
    }

    /// Returns true if `unit` is the revision that already failed to start.
    pub fn is_failed_at(&self, unit: &Unit) -> bool {
        self.state == UnitState::Failed && self.failed_revision == Some(unit.revision)
    }
}

/// Table of units known to this agent.
#[derive(Default)]
pub struct UnitManager {
    units: RwLock<BTreeMap<UnitName, LocalUnit>>,
}

impl UnitManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &UnitName) -> Option<LocalUnit> {
        self.units.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &UnitName) -> bool {
        self.units.read().await.contains_key(name)
    }

    /// Names of all tracked units, sorted.
    pub async fn names(&self) -> Vec<UnitName> {
        self.units.read().await.keys().cloned().collect()
    }

    /// Snapshot of all tracked units.
    pub async fn list(&self) -> Vec<LocalUnit> {
        self.units.read().await.values().cloned().collect()
    }

    /// Get the count of units currently launched.
    pub async fn launched_count(&self) -> usize {
        self.units
            .read()
            .await
            .values()
            .filter(|u| u.state == UnitState::Launched)
            .count()
    }

    /// Track `unit`, refreshing the stored definition of an existing entry.
    pub async fn track(&self, unit: &Unit) -> LocalUnit {
        let mut units = self.units.write().await;
        let entry = units
            .entry(unit.name.clone())
            .or_insert_with(|| LocalUnit::new(unit.clone()));
        entry.unit = unit.clone();
        entry.clone()
    }

    /// Record a state transition. Returns false if the unit is not tracked.
    pub async fn transition(
        &self,
        name: &UnitName,
        state: UnitState,
        status: ProcessStatus,
        message: Option<String>,
    ) -> bool {
        let mut units = self.units.write().await;
        let Some(local) = units.get_mut(name) else {
            return false;
        };
        local.state = state;
        local.status = status;
        local.message = message;
        if state == UnitState::Failed {
            local.failed_revision = Some(local.unit.revision);
        } else {
            local.failed_revision = None;
        }
        true
    }

    /// Mark `state` as reported if it is still the current state.
    pub async fn mark_reported(&self, name: &UnitName, state: UnitState) {
        let mut units = self.units.write().await;
        if let Some(local) = units.get_mut(name) {
            if local.state == state {
                local.mark_status_reported();
            }
        }
    }

    pub async fn remove(&self, name: &UnitName) -> Option<LocalUnit> {
        self.units.write().await.remove(name)
    }
}
