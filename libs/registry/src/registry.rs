//! Registry operations over the coordination store.
//!
//! Every store call is bounded by the configured operation timeout and
//! transient failures are retried with capped exponential backoff. A call that
//! still fails transiently surfaces as [`RegistryError::Unavailable`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_coord::{
    with_timeout, CoordError, CoordResult, KeyValue, LeaseHandle, Precondition, Store,
};
use fleet_id::{EngineId, MachineId, UnitName};
use fleet_reconcile::{retry, BackoffPolicy, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::keys::{Keys, DEFAULT_ROOT};
use crate::model::{
    ClusterVersion, LeaderRecord, Machine, Placement, ProcessStatus, ReportOutcome, RuntimeState,
    TargetState, Unit, UnitState,
};
use crate::watch::RegistryWatch;

/// Attempts for read-check-CAS sequences that lose a race.
const CAS_ATTEMPTS: u32 = 3;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Key root.
    pub root: String,

    /// Bound on a single store call.
    pub op_timeout: Duration,

    /// Retry policy for transient store failures.
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            op_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                backoff: BackoffPolicy {
                    base: Duration::from_millis(50),
                    max: Duration::from_secs(2),
                    jitter: 0.25,
                },
                max_attempts: 5,
            },
        }
    }
}

/// The cluster registry.
pub struct Registry {
    store: Arc<dyn Store>,
    keys: Keys,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, config: RegistryConfig) -> Self {
        Self {
            keys: Keys::new(&config.root),
            store,
            config,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one store call with timeout and bounded transient retries.
    async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordResult<T>>,
    {
        let timeout = self.config.op_timeout;
        retry(
            operation,
            &self.config.retry,
            |e: &CoordError| e.is_transient(),
            || with_timeout(timeout, op()),
        )
        .await
        .map_err(RegistryError::from)
    }

    async fn get(&self, key: &str) -> RegistryResult<Option<KeyValue>> {
        self.call("get", || self.store.get(key)).await
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> RegistryResult<Vec<(KeyValue, T)>> {
        let snapshot = self.call("list", || self.store.list(prefix)).await?;
        snapshot
            .entries
            .into_iter()
            .map(|kv| {
                let record = decode(&kv)?;
                Ok((kv, record))
            })
            .collect()
    }

    // =========================================================================
    // Units
    // =========================================================================

    /// Create a unit. Fails with `AlreadyExists` if the name is taken.
    #[instrument(skip(self, unit), fields(unit = %unit.name))]
    pub async fn create_unit(&self, unit: &Unit) -> RegistryResult<Unit> {
        let key = self.keys.unit(&unit.name);
        let value = encode(&key, unit)?;

        let index = match self
            .call("create_unit", || {
                self.store
                    .compare_and_swap(&key, Precondition::Absent, value.clone(), None)
            })
            .await
        {
            Ok(index) => index,
            Err(RegistryError::Coordination(CoordError::CasFailed { .. })) => {
                return Err(RegistryError::AlreadyExists(unit.name.clone()));
            }
            Err(e) => return Err(e),
        };

        info!(target_state = %unit.target_state, "Unit created");
        let mut created = unit.clone();
        created.revision = index;
        Ok(created)
    }

    /// Remove a unit together with its placement and runtime state.
    ///
    /// Idempotent. Returns false if the unit did not exist.
    #[instrument(skip(self), fields(unit = %name))]
    pub async fn destroy_unit(&self, name: &UnitName) -> RegistryResult<bool> {
        let unit_key = self.keys.unit(name);
        let existed = self
            .call("destroy_unit", || self.store.delete(&unit_key))
            .await?;
        self.release_placement(name).await?;

        if existed {
            info!("Unit destroyed");
        }
        Ok(existed)
    }

    /// Overwrite the target state of a unit. Last writer wins.
    ///
    /// The unit revision changes on every call, even if the state is unchanged.
    /// The write is conditional on the record read, so a unit destroyed in
    /// between is reported as `NotFound` rather than written back.
    #[instrument(skip(self), fields(unit = %name))]
    pub async fn set_target_state(
        &self,
        name: &UnitName,
        state: TargetState,
    ) -> RegistryResult<u64> {
        let key = self.keys.unit(name);

        for _ in 0..CAS_ATTEMPTS {
            let Some(kv) = self.get(&key).await? else {
                return Err(RegistryError::unit_not_found(name));
            };
            let mut unit = decode_unit(&kv)?;
            unit.target_state = state;
            let value = encode(&key, &unit)?;
            let expected = Precondition::Value(kv.value);

            match self
                .call("set_target_state", || {
                    self.store
                        .compare_and_swap(&key, expected.clone(), value.clone(), None)
                })
                .await
            {
                Ok(index) => {
                    info!(target_state = %state, revision = index, "Target state set");
                    return Ok(index);
                }
                Err(RegistryError::Coordination(CoordError::CasFailed { .. })) => {
                    debug!("Unit changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(RegistryError::Coordination(CoordError::CasFailed {
            key,
            current: None,
        }))
    }

    pub async fn unit(&self, name: &UnitName) -> RegistryResult<Option<Unit>> {
        match self.get(&self.keys.unit(name)).await? {
            Some(kv) => decode_unit(&kv).map(Some),
            None => Ok(None),
        }
    }

    /// All units, sorted by name.
    pub async fn list_units(&self) -> RegistryResult<Vec<Unit>> {
        let entries = self.list::<Unit>(&self.keys.units()).await?;
        Ok(entries
            .into_iter()
            .map(|(kv, mut unit)| {
                unit.revision = kv.mod_index;
                unit
            })
            .collect())
    }

    // =========================================================================
    // Machines
    // =========================================================================

    /// Publish a machine record under a fresh lease.
    ///
    /// Replaces any record left by a previous lease of the same machine.
    #[instrument(skip(self, machine), fields(machine = %machine.id))]
    pub async fn register_machine(
        &self,
        machine: &Machine,
        ttl: Duration,
    ) -> RegistryResult<LeaseHandle> {
        let key = self.keys.machine(&machine.id);
        let value = encode(&key, machine)?;

        let handle = self
            .call("register_machine", || {
                LeaseHandle::attach(self.store.clone(), key.clone(), value.clone(), ttl)
            })
            .await?;

        info!(lease = %handle.lease_id(), ttl_secs = ttl.as_secs(), "Machine registered");
        Ok(handle)
    }

    pub async fn machine(&self, id: &MachineId) -> RegistryResult<Option<Machine>> {
        match self.get(&self.keys.machine(id)).await? {
            Some(kv) => decode(&kv).map(Some),
            None => Ok(None),
        }
    }

    /// Currently registered machines, sorted by ID.
    pub async fn list_machines(&self) -> RegistryResult<Vec<Machine>> {
        let entries = self.list::<Machine>(&self.keys.machines()).await?;
        Ok(entries.into_iter().map(|(_, machine)| machine).collect())
    }

    // =========================================================================
    // Placements
    // =========================================================================

    /// Assign a unit to a machine.
    ///
    /// Succeeds only if the unit has no placement, or its placement targets a
    /// machine that is no longer registered. A live holder, including losing
    /// the CAS race to another claimant, yields `AlreadyScheduled`.
    #[instrument(skip(self), fields(unit = %name, machine = %machine))]
    pub async fn claim_placement(
        &self,
        name: &UnitName,
        machine: &MachineId,
    ) -> RegistryResult<Placement> {
        if self.unit(name).await?.is_none() {
            return Err(RegistryError::unit_not_found(name));
        }
        if self.machine(machine).await?.is_none() {
            return Err(RegistryError::machine_not_found(machine));
        }

        let key = self.keys.placement(name);
        let placement = Placement {
            unit: name.clone(),
            machine: Some(machine.clone()),
            state: UnitState::Inactive,
        };
        let value = encode(&key, &placement)?;

        for _ in 0..CAS_ATTEMPTS {
            let (expected, stale) = match self.get(&key).await? {
                None => (Precondition::Absent, None),
                Some(kv) => {
                    let existing: Placement = decode(&kv)?;
                    if let Some(holder) = &existing.machine {
                        if self.machine(holder).await?.is_some() {
                            return Err(RegistryError::AlreadyScheduled {
                                unit: name.clone(),
                                machine: holder.clone(),
                            });
                        }
                    }
                    (Precondition::Value(kv.value), existing.machine)
                }
            };

            let result = self
                .call("claim_placement", || {
                    self.store
                        .compare_and_swap(&key, expected.clone(), value.clone(), None)
                })
                .await;

            match result {
                Ok(_) => {
                    if let Some(previous) = stale {
                        let runtime_key = self.keys.runtime(name, &previous);
                        if let Err(e) = self
                            .call("clear_stale_runtime", || self.store.delete(&runtime_key))
                            .await
                        {
                            warn!(
                                previous = %previous,
                                error = %e,
                                "Failed to clear runtime state of departed machine"
                            );
                        }
                        info!(previous = %previous, "Replaced placement on departed machine");
                    } else {
                        info!("Placement claimed");
                    }
                    return Ok(placement);
                }
                Err(RegistryError::Coordination(CoordError::CasFailed { current, .. })) => {
                    let holder = current
                        .and_then(|v| serde_json::from_str::<Placement>(&v).ok())
                        .and_then(|p| p.machine);
                    if let Some(holder) = holder {
                        debug!(holder = %holder, "Lost placement race");
                        return Err(RegistryError::AlreadyScheduled {
                            unit: name.clone(),
                            machine: holder,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(RegistryError::Coordination(CoordError::CasFailed {
            key,
            current: None,
        }))
    }

    /// Clear the placement and all runtime state of a unit. Idempotent.
    #[instrument(skip(self), fields(unit = %name))]
    pub async fn release_placement(&self, name: &UnitName) -> RegistryResult<bool> {
        let key = self.keys.placement(name);
        let runtime_prefix = self.keys.runtime_of(name);

        let existed = self
            .call("release_placement", || self.store.delete(&key))
            .await?;
        self.call("release_runtime", || self.store.delete_prefix(&runtime_prefix))
            .await?;

        if existed {
            debug!("Placement released");
        }
        Ok(existed)
    }

    /// Placement view of a unit; unscheduled if it has no placement record.
    pub async fn placement(&self, name: &UnitName) -> RegistryResult<Placement> {
        if let Some(kv) = self.get(&self.keys.placement(name)).await? {
            return decode(&kv);
        }
        if self.unit(name).await?.is_some() {
            return Ok(Placement::unscheduled(name.clone()));
        }
        Err(RegistryError::unit_not_found(name))
    }

    /// One placement per unit, sorted by unit name.
    ///
    /// Units without a record appear unscheduled. Placement records whose unit
    /// is gone are included as well.
    pub async fn list_placements(&self) -> RegistryResult<Vec<Placement>> {
        let units = self.list::<Unit>(&self.keys.units()).await?;
        let records = self.list::<Placement>(&self.keys.placements()).await?;

        let mut placements: BTreeMap<UnitName, Placement> = units
            .into_iter()
            .map(|(_, unit)| (unit.name.clone(), Placement::unscheduled(unit.name)))
            .collect();
        for (_, placement) in records {
            placements.insert(placement.unit.clone(), placement);
        }

        Ok(placements.into_values().collect())
    }

    // =========================================================================
    // Runtime State
    // =========================================================================

    /// Record the observed state of a unit on `machine`.
    ///
    /// If the unit is no longer placed on `machine` nothing is written and
    /// [`ReportOutcome::Stale`] is returned.
    #[instrument(skip(self, message), fields(unit = %name, machine = %machine, state = %state))]
    pub async fn report_runtime_state(
        &self,
        name: &UnitName,
        machine: &MachineId,
        state: UnitState,
        status: ProcessStatus,
        message: Option<String>,
    ) -> RegistryResult<ReportOutcome> {
        let key = self.keys.placement(name);
        let mut updated = false;

        for _ in 0..CAS_ATTEMPTS {
            let Some(kv) = self.get(&key).await? else {
                warn!("Dropping report for unplaced unit");
                return Ok(ReportOutcome::Stale);
            };
            let mut placement: Placement = decode(&kv)?;
            if !placement.is_on(machine) {
                warn!(holder = ?placement.machine, "Dropping report for unit placed elsewhere");
                return Ok(ReportOutcome::Stale);
            }
            if placement.state == state {
                updated = true;
                break;
            }

            placement.state = state;
            let value = encode(&key, &placement)?;
            let expected = Precondition::Value(kv.value);
            match self
                .call("report_placement_state", || {
                    self.store
                        .compare_and_swap(&key, expected.clone(), value.clone(), None)
                })
                .await
            {
                Ok(_) => {
                    updated = true;
                    break;
                }
                Err(RegistryError::Coordination(CoordError::CasFailed { .. })) => {
                    debug!("Placement changed during report, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        if !updated {
            return Err(RegistryError::Coordination(CoordError::CasFailed {
                key,
                current: None,
            }));
        }

        let runtime = RuntimeState {
            unit: name.clone(),
            machine: machine.clone(),
            state,
            status,
            heartbeat: Utc::now(),
            message,
        };
        let runtime_key = self.keys.runtime(name, machine);
        let value = encode(&runtime_key, &runtime)?;
        self.call("report_runtime_state", || {
            self.store.put(&runtime_key, value.clone(), None)
        })
        .await?;

        debug!(status = %status, "Runtime state recorded");
        Ok(ReportOutcome::Recorded)
    }

    /// Remove the runtime record `machine` wrote for a unit.
    pub async fn clear_runtime_state(
        &self,
        name: &UnitName,
        machine: &MachineId,
    ) -> RegistryResult<bool> {
        let key = self.keys.runtime(name, machine);
        self.call("clear_runtime_state", || self.store.delete(&key))
            .await
    }

    /// Runtime records of a unit, sorted by machine.
    pub async fn runtime_states(&self, name: &UnitName) -> RegistryResult<Vec<RuntimeState>> {
        let entries = self
            .list::<RuntimeState>(&self.keys.runtime_of(name))
            .await?;
        Ok(entries.into_iter().map(|(_, state)| state).collect())
    }

    // =========================================================================
    // Leadership and Versioning
    // =========================================================================

    /// Try to become the scheduling engine. Returns `None` if another engine
    /// holds the leader key.
    #[instrument(skip(self), fields(engine = %engine))]
    pub async fn acquire_leadership(
        &self,
        engine: &EngineId,
        ttl: Duration,
    ) -> RegistryResult<Option<LeaseHandle>> {
        let key = self.keys.leader();
        let record = LeaderRecord {
            engine: *engine,
            acquired_at: Utc::now(),
        };
        let value = encode(&key, &record)?;

        match self
            .call("acquire_leadership", || {
                LeaseHandle::acquire(self.store.clone(), key.clone(), value.clone(), ttl)
            })
            .await
        {
            Ok(handle) => {
                info!(lease = %handle.lease_id(), "Acquired engine leadership");
                Ok(Some(handle))
            }
            Err(RegistryError::Coordination(CoordError::CasFailed { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn leader(&self) -> RegistryResult<Option<LeaderRecord>> {
        match self.get(&self.keys.leader()).await? {
            Some(kv) => decode(&kv).map(Some),
            None => Ok(None),
        }
    }

    pub async fn latest_version(&self) -> RegistryResult<Option<ClusterVersion>> {
        match self.get(&self.keys.version()).await? {
            Some(kv) => decode(&kv).map(Some),
            None => Ok(None),
        }
    }

    /// Advance the cluster version. Never moves it backwards.
    ///
    /// Returns true if the stored version changed.
    #[instrument(skip(self), fields(version = %version))]
    pub async fn set_latest_version(&self, version: ClusterVersion) -> RegistryResult<bool> {
        let key = self.keys.version();
        let value = encode(&key, &version)?;

        for _ in 0..CAS_ATTEMPTS {
            let expected = match self.get(&key).await? {
                Some(kv) => {
                    let current: ClusterVersion = decode(&kv)?;
                    if current >= version {
                        return Ok(false);
                    }
                    Precondition::Value(kv.value)
                }
                None => Precondition::Absent,
            };

            match self
                .call("set_latest_version", || {
                    self.store
                        .compare_and_swap(&key, expected.clone(), value.clone(), None)
                })
                .await
            {
                Ok(_) => {
                    info!("Cluster version advanced");
                    return Ok(true);
                }
                Err(RegistryError::Coordination(CoordError::CasFailed { .. })) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(false)
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Watch every registry key.
    pub async fn watch(&self) -> RegistryResult<RegistryWatch> {
        let base = self.keys.base().to_string();
        let watch = self
            .call("watch", || fleet_coord::watch_prefix(self.store.clone(), base.clone()))
            .await?;
        Ok(RegistryWatch::new(watch, self.keys.clone()))
    }
}

pub(crate) fn decode<T: DeserializeOwned>(kv: &KeyValue) -> RegistryResult<T> {
    serde_json::from_str(&kv.value).map_err(|e| RegistryError::Corrupt {
        key: kv.key.clone(),
        reason: e.to_string(),
    })
}

pub(crate) fn decode_unit(kv: &KeyValue) -> RegistryResult<Unit> {
    let mut unit: Unit = decode(kv)?;
    unit.revision = kv.mod_index;
    Ok(unit)
}

fn encode<T: Serialize>(key: &str, record: &T) -> RegistryResult<String> {
    serde_json::to_string(record).map_err(|e| RegistryError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
