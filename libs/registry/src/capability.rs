//! Registry capabilities, one per consumer.
//!
//! Components receive an `Arc<dyn …>` of the narrowest trait they need. The
//! [`Registry`] implements all of them.

use std::time::Duration;

use async_trait::async_trait;
use fleet_coord::LeaseHandle;
use fleet_id::{EngineId, MachineId, UnitName};

use crate::error::RegistryResult;
use crate::model::{
    ClusterVersion, Machine, Placement, ProcessStatus, ReportOutcome, RuntimeState, TargetState,
    Unit, UnitState,
};
use crate::registry::Registry;
use crate::watch::RegistryWatch;

/// Operations used by the submission path.
#[async_trait]
pub trait SubmitRegistry: Send + Sync {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<Unit>;
    async fn destroy_unit(&self, name: &UnitName) -> RegistryResult<bool>;
    async fn set_target_state(&self, name: &UnitName, state: TargetState) -> RegistryResult<u64>;
    async fn unit(&self, name: &UnitName) -> RegistryResult<Option<Unit>>;
    async fn list_units(&self) -> RegistryResult<Vec<Unit>>;
    async fn placement(&self, name: &UnitName) -> RegistryResult<Placement>;
    async fn list_placements(&self) -> RegistryResult<Vec<Placement>>;
    async fn list_machines(&self) -> RegistryResult<Vec<Machine>>;
    async fn runtime_states(&self, name: &UnitName) -> RegistryResult<Vec<RuntimeState>>;
}

/// Operations used by the scheduling engine.
#[async_trait]
pub trait SchedulerRegistry: Send + Sync {
    async fn list_units(&self) -> RegistryResult<Vec<Unit>>;
    async fn list_machines(&self) -> RegistryResult<Vec<Machine>>;
    async fn list_placements(&self) -> RegistryResult<Vec<Placement>>;
    async fn claim_placement(
        &self,
        name: &UnitName,
        machine: &MachineId,
    ) -> RegistryResult<Placement>;
    async fn release_placement(&self, name: &UnitName) -> RegistryResult<bool>;
    async fn acquire_leadership(
        &self,
        engine: &EngineId,
        ttl: Duration,
    ) -> RegistryResult<Option<LeaseHandle>>;
    async fn latest_version(&self) -> RegistryResult<Option<ClusterVersion>>;
    async fn set_latest_version(&self, version: ClusterVersion) -> RegistryResult<bool>;
    async fn watch(&self) -> RegistryResult<RegistryWatch>;
}

/// Operations used by a machine agent.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn register_machine(
        &self,
        machine: &Machine,
        ttl: Duration,
    ) -> RegistryResult<LeaseHandle>;
    async fn watch(&self) -> RegistryResult<RegistryWatch>;
    async fn list_units(&self) -> RegistryResult<Vec<Unit>>;
    async fn list_placements(&self) -> RegistryResult<Vec<Placement>>;
    async fn report_runtime_state(
        &self,
        name: &UnitName,
        machine: &MachineId,
        state: UnitState,
        status: ProcessStatus,
        message: Option<String>,
    ) -> RegistryResult<ReportOutcome>;
    async fn clear_runtime_state(&self, name: &UnitName, machine: &MachineId)
        -> RegistryResult<bool>;
}

#[async_trait]
impl SubmitRegistry for Registry {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<Unit> {
        Registry::create_unit(self, unit).await
    }

    async fn destroy_unit(&self, name: &UnitName) -> RegistryResult<bool> {
        Registry::destroy_unit(self, name).await
    }

    async fn set_target_state(&self, name: &UnitName, state: TargetState) -> RegistryResult<u64> {
        Registry::set_target_state(self, name, state).await
    }

    async fn unit(&self, name: &UnitName) -> RegistryResult<Option<Unit>> {
        Registry::unit(self, name).await
    }

    async fn list_units(&self) -> RegistryResult<Vec<Unit>> {
        Registry::list_units(self).await
    }

    async fn placement(&self, name: &UnitName) -> RegistryResult<Placement> {
        Registry::placement(self, name).await
    }

    async fn list_placements(&self) -> RegistryResult<Vec<Placement>> {
        Registry::list_placements(self).await
    }

    async fn list_machines(&self) -> RegistryResult<Vec<Machine>> {
        Registry::list_machines(self).await
    }

    async fn runtime_states(&self, name: &UnitName) -> RegistryResult<Vec<RuntimeState>> {
        Registry::runtime_states(self, name).await
    }
}

#[async_trait]
impl SchedulerRegistry for Registry {
    async fn list_units(&self) -> RegistryResult<Vec<Unit>> {
        Registry::list_units(self).await
    }

    async fn list_machines(&self) -> RegistryResult<Vec<Machine>> {
        Registry::list_machines(self).await
    }

    async fn list_placements(&self) -> RegistryResult<Vec<Placement>> {
        Registry::list_placements(self).await
    }

    async fn claim_placement(
        &self,
        name: &UnitName,
        machine: &MachineId,
    ) -> RegistryResult<Placement> {
        Registry::claim_placement(self, name, machine).await
    }

    async fn release_placement(&self, name: &UnitName) -> RegistryResult<bool> {
        Registry::release_placement(self, name).await
    }

    async fn acquire_leadership(
        &self,
        engine: &EngineId,
        ttl: Duration,
    ) -> RegistryResult<Option<LeaseHandle>> {
        Registry::acquire_leadership(self, engine, ttl).await
    }

    async fn latest_version(&self) -> RegistryResult<Option<ClusterVersion>> {
        Registry::latest_version(self).await
    }

    async fn set_latest_version(&self, version: ClusterVersion) -> RegistryResult<bool> {
        Registry::set_latest_version(self, version).await
    }

    async fn watch(&self) -> RegistryResult<RegistryWatch> {
        Registry::watch(self).await
    }
}

#[async_trait]
impl AgentRegistry for Registry {
    async fn register_machine(
        &self,
        machine: &Machine,
        ttl: Duration,
    ) -> RegistryResult<LeaseHandle> {
        Registry::register_machine(self, machine, ttl).await
    }

    async fn watch(&self) -> RegistryResult<RegistryWatch> {
        Registry::watch(self).await
    }

    async fn list_units(&self) -> RegistryResult<Vec<Unit>> {
        Registry::list_units(self).await
    }

    async fn list_placements(&self) -> RegistryResult<Vec<Placement>> {
        Registry::list_placements(self).await
    }

    async fn report_runtime_state(
        &self,
        name: &UnitName,
        machine: &MachineId,
        state: UnitState,
        status: ProcessStatus,
        message: Option<String>,
    ) -> RegistryResult<ReportOutcome> {
        Registry::report_runtime_state(self, name, machine, state, status, message).await
    }

    async fn clear_runtime_state(
        &self,
        name: &UnitName,
        machine: &MachineId,
    ) -> RegistryResult<bool> {
        Registry::clear_runtime_state(self, name, machine).await
    }
}
