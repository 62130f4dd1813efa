//! Registry record types.
//!
//! Records are stored as JSON under the key layout in [`crate::keys`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleet_coord::Index;
use fleet_id::{EngineId, MachineId, UnitName};
use serde::{Deserialize, Serialize};

// =============================================================================
// State Enums
// =============================================================================

/// Desired state of a unit, set by the submission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Inactive,
    Loaded,
    Launched,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Loaded => "loaded",
            Self::Launched => "launched",
        }
    }

    /// Returns true if the unit should hold a placement.
    pub fn wants_placement(&self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "loaded" => Ok(Self::Loaded),
            "launched" => Ok(Self::Launched),
            other => Err(format!("unknown target state: {other}")),
        }
    }
}

/// Observed state of a placed unit, written by the owning agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Inactive,
    Loading,
    Loaded,
    Launching,
    Launched,
    Failed,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Launching => "launching",
            Self::Launched => "launched",
            Self::Failed => "failed",
        }
    }

    /// Returns true if the observed state satisfies `target`.
    pub fn satisfies(&self, target: TargetState) -> bool {
        matches!(
            (self, target),
            (Self::Inactive, TargetState::Inactive)
                | (Self::Loaded, TargetState::Loaded)
                | (Self::Launched, TargetState::Launched)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process status as seen by the local runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Units
// =============================================================================

/// Placement requirements: key → accepted values. A machine satisfies a key
/// if its tag for that key equals any accepted value.
pub type Requirements = BTreeMap<String, Vec<String>>;

/// A schedulable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: UnitName,

    /// Opaque unit definition text.
    pub definition: String,

    pub target_state: TargetState,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: Requirements,

    /// Glob patterns over unit names that may not share a machine with this unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Store modify index of the unit record. Filled on read.
    #[serde(skip)]
    pub revision: Index,
}

impl Unit {
    /// A unit with no requirements, targeting `launched`.
    pub fn new(name: UnitName, definition: impl Into<String>) -> Self {
        Self {
            name,
            definition: definition.into(),
            target_state: TargetState::Launched,
            requirements: Requirements::new(),
            conflicts: Vec::new(),
            signature: None,
            revision: 0,
        }
    }

    pub fn with_target(mut self, target: TargetState) -> Self {
        self.target_state = target;
        self
    }

    /// Add an accepted value for a requirement key.
    pub fn with_requirement(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_conflict(mut self, pattern: impl Into<String>) -> Self {
        self.conflicts.push(pattern.into());
        self
    }

    /// Bytes covered by the unit signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.name.as_str().len() + self.definition.len() + 1);
        payload.extend_from_slice(self.name.as_str().as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(self.definition.as_bytes());
        payload
    }
}

// =============================================================================
// Machines
// =============================================================================

/// A registered agent host. Present only while its lease is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,

    #[serde(default)]
    pub public_ip: String,

    /// Tag set matched against unit requirements.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Agent version.
    #[serde(default)]
    pub version: String,
}

impl Machine {
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            public_ip: String::new(),
            metadata: BTreeMap::new(),
            version: String::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = ip.into();
        self
    }
}

// =============================================================================
// Placement and Runtime State
// =============================================================================

/// Assignment of a unit to a machine plus its reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub unit: UnitName,

    /// Owning machine, `None` while unscheduled.
    pub machine: Option<MachineId>,

    pub state: UnitState,
}

impl Placement {
    /// Placement view of a unit without a placement record.
    pub fn unscheduled(unit: UnitName) -> Self {
        Self {
            unit,
            machine: None,
            state: UnitState::Inactive,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.machine.is_some()
    }

    /// Returns true if this placement targets `machine`.
    pub fn is_on(&self, machine: &MachineId) -> bool {
        self.machine.as_ref() == Some(machine)
    }
}

/// Runtime record written by the agent running a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub unit: UnitName,
    pub machine: MachineId,
    pub state: UnitState,
    pub status: ProcessStatus,
    pub heartbeat: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a runtime state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Placement state and runtime record were written.
    Recorded,
    /// The placement no longer targets the reporting machine; nothing written.
    Stale,
}

impl ReportOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded)
    }
}

// =============================================================================
// Leadership and Versioning
// =============================================================================

/// Contents of the engine leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub engine: EngineId,
    pub acquired_at: DateTime<Utc>,
}

/// Cluster schema version (`major.minor.patch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ClusterVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `major.minor.patch`; missing trailing components default to 0.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let mut next = |label: &str| -> Result<u32, String> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p
                    .parse()
                    .map_err(|_| format!("invalid {label} version component in {s:?}")),
            }
        };

        let version = Self::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(format!("too many version components in {s:?}"));
        }
        Ok(version)
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ClusterVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ClusterVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ClusterVersion> for String {
    fn from(v: ClusterVersion) -> Self {
        v.to_string()
    }
}
