//! Submission path: admitting units and driving their target state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{MachineId, UnitName};
use tracing::{debug, info, instrument};

use crate::capability::SubmitRegistry;
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Placement, Requirements, RuntimeState, TargetState, Unit};
use crate::signing::{sign_unit, verify_unit, PayloadSigner, PayloadVerifier};

/// Default number of placement polls in [`Submitter::wait_for_scheduled`].
pub const DEFAULT_BLOCK_ATTEMPTS: u32 = 10;

/// Default delay between placement polls.
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Parse a requirement string of the form `key=value,key=value`.
///
/// Repeated keys accumulate accepted values. Pairs without `=` or with an
/// empty key are skipped; keys and values are trimmed.
pub fn parse_requirements(input: &str) -> Requirements {
    let mut requirements = Requirements::new();
    for pair in input.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        requirements
            .entry(key.to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    requirements
}

/// Scheduling outcome reported by [`Submitter::wait_for_scheduled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleStatus {
    Scheduled(MachineId),
    Queued,
}

impl ScheduleStatus {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled(machine) => write!(f, "scheduled to {machine}"),
            Self::Queued => f.write_str("still queued"),
        }
    }
}

/// Combined status view of one unit.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub unit: Unit,
    pub placement: Placement,
    pub runtime: Vec<RuntimeState>,
}

/// Admits units into the registry and changes their target state.
pub struct Submitter {
    registry: Arc<dyn SubmitRegistry>,
    signer: Option<Arc<dyn PayloadSigner>>,
    verifier: Option<Arc<dyn PayloadVerifier>>,
}

impl Submitter {
    pub fn new(registry: Arc<dyn SubmitRegistry>) -> Self {
        Self {
            registry,
            signer: None,
            verifier: None,
        }
    }

    /// Sign every unit before creating it.
    pub fn with_signer(mut self, signer: Arc<dyn PayloadSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Reject units whose signature does not verify.
    pub fn with_verifier(mut self, verifier: Arc<dyn PayloadVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Create a unit, signing and verifying it first when configured.
    #[instrument(skip(self, unit), fields(unit = %unit.name))]
    pub async fn submit(&self, mut unit: Unit) -> RegistryResult<Unit> {
        if let Some(signer) = &self.signer {
            sign_unit(signer.as_ref(), &mut unit);
        }
        if let Some(verifier) = &self.verifier {
            if !verify_unit(verifier.as_ref(), &unit) {
                return Err(RegistryError::SignatureInvalid(unit.name));
            }
        }
        self.registry.create_unit(&unit).await
    }

    /// Set the target state to `launched`.
    pub async fn start(&self, name: &UnitName) -> RegistryResult<u64> {
        self.registry
            .set_target_state(name, TargetState::Launched)
            .await
    }

    /// Set the target state to `loaded`.
    pub async fn stop(&self, name: &UnitName) -> RegistryResult<u64> {
        self.registry.set_target_state(name, TargetState::Loaded).await
    }

    /// Set the target state to `inactive`.
    pub async fn unload(&self, name: &UnitName) -> RegistryResult<u64> {
        self.registry
            .set_target_state(name, TargetState::Inactive)
            .await
    }

    /// Remove a unit. Idempotent.
    pub async fn destroy(&self, name: &UnitName) -> RegistryResult<bool> {
        self.registry.destroy_unit(name).await
    }

    pub async fn status(&self, name: &UnitName) -> RegistryResult<UnitStatus> {
        let unit = self
            .registry
            .unit(name)
            .await?
            .ok_or_else(|| RegistryError::unit_not_found(name))?;
        let placement = self.registry.placement(name).await?;
        let runtime = self.registry.runtime_states(name).await?;
        Ok(UnitStatus {
            unit,
            placement,
            runtime,
        })
    }

    /// Poll placements until every unit in `names` has a machine, or
    /// `attempts` polls have been made.
    #[instrument(skip(self, names), fields(units = names.len()))]
    pub async fn wait_for_scheduled(
        &self,
        names: &[UnitName],
        attempts: u32,
        interval: Duration,
    ) -> RegistryResult<BTreeMap<UnitName, ScheduleStatus>> {
        let mut results: BTreeMap<UnitName, ScheduleStatus> = names
            .iter()
            .map(|name| (name.clone(), ScheduleStatus::Queued))
            .collect();

        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }

            let placements = self.registry.list_placements().await?;
            for placement in placements {
                if let (Some(status), Some(machine)) =
                    (results.get_mut(&placement.unit), placement.machine)
                {
                    *status = ScheduleStatus::Scheduled(machine);
                }
            }

            let pending = results
                .values()
                .filter(|s| matches!(s, ScheduleStatus::Queued))
                .count();
            if pending == 0 {
                break;
            }
            debug!(attempt = attempt + 1, pending, "Waiting for units to be scheduled");
        }

        for (name, status) in &results {
            info!(unit = %name, "Unit {status}");
        }
        Ok(results)
    }
}
