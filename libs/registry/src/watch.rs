//! Typed registry change feed.

use fleet_coord::{Watch, WatchEvent, WatchUpdate};
use fleet_id::{EngineId, MachineId, UnitName};
use tracing::warn;

use crate::error::{RegistryError, RegistryResult};
use crate::keys::{KeyRef, Keys};
use crate::model::{ClusterVersion, LeaderRecord, Machine, Placement, Unit};

/// A registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Arbitrary changes may have been missed; consumers must re-read.
    Resync,
    UnitChanged(Unit),
    UnitRemoved(UnitName),
    /// A machine registered or refreshed its record.
    MachineJoined(Machine),
    /// A machine record was deleted or its lease expired.
    MachineLost(MachineId),
    PlacementChanged(Placement),
    PlacementReleased(UnitName),
    RuntimeChanged { unit: UnitName, machine: MachineId },
    LeaderChanged(Option<EngineId>),
    VersionChanged(ClusterVersion),
}

/// Watch over every registry key.
pub struct RegistryWatch {
    inner: Watch,
    keys: Keys,
}

impl RegistryWatch {
    pub(crate) fn new(inner: Watch, keys: Keys) -> Self {
        Self { inner, keys }
    }

    /// Wait for the next change. The first item is always [`RegistryEvent::Resync`].
    ///
    /// Returns `Ok(None)` once the store feed is closed.
    pub async fn next(&mut self) -> RegistryResult<Option<RegistryEvent>> {
        loop {
            let update = self.inner.next().await.map_err(RegistryError::from)?;
            match update {
                None => return Ok(None),
                Some(WatchUpdate::Snapshot(_)) => return Ok(Some(RegistryEvent::Resync)),
                Some(WatchUpdate::Event(event)) => {
                    if let Some(mapped) = self.map_event(event) {
                        return Ok(Some(mapped));
                    }
                }
            }
        }
    }

    fn map_event(&self, event: WatchEvent) -> Option<RegistryEvent> {
        let key_ref = self.keys.classify(&event.key)?;
        let removed = event.kind.is_removal();

        let mapped = match key_ref {
            KeyRef::Unit(name) if removed => RegistryEvent::UnitRemoved(name),
            KeyRef::Unit(_) => {
                let mut unit: Unit = self.decode(&event)?;
                unit.revision = event.index;
                RegistryEvent::UnitChanged(unit)
            }
            KeyRef::Machine(id) if removed => RegistryEvent::MachineLost(id),
            KeyRef::Machine(_) => RegistryEvent::MachineJoined(self.decode(&event)?),
            KeyRef::Placement(name) if removed => RegistryEvent::PlacementReleased(name),
            KeyRef::Placement(_) => RegistryEvent::PlacementChanged(self.decode(&event)?),
            KeyRef::Runtime(unit, machine) => RegistryEvent::RuntimeChanged { unit, machine },
            KeyRef::Leader if removed => RegistryEvent::LeaderChanged(None),
            KeyRef::Leader => {
                let record: LeaderRecord = self.decode(&event)?;
                RegistryEvent::LeaderChanged(Some(record.engine))
            }
            KeyRef::Version if removed => return None,
            KeyRef::Version => RegistryEvent::VersionChanged(self.decode(&event)?),
        };
        Some(mapped)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, event: &WatchEvent) -> Option<T> {
        let value = event.value.as_deref()?;
        match serde_json::from_str(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %event.key, error = %e, "Skipping undecodable record in watch");
                None
            }
        }
    }

    /// Re-list the registry immediately.
    pub async fn resync(&mut self) -> RegistryResult<RegistryEvent> {
        self.inner.resync().await.map_err(RegistryError::from)?;
        Ok(RegistryEvent::Resync)
    }
}
