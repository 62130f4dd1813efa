//! Store key layout.
//!
//! ```text
//! <root>/units/<unit>                 unit record
//! <root>/machines/<machine>           machine record (leased)
//! <root>/placements/<unit>            placement record (CAS-guarded)
//! <root>/runtime/<unit>/<machine>     runtime record
//! <root>/engine/leader                leader record (leased)
//! <root>/version                      cluster version
//! ```

use fleet_id::{MachineId, UnitName};

/// Default key root.
pub const DEFAULT_ROOT: &str = "/fleet";

const UNITS: &str = "units/";
const MACHINES: &str = "machines/";
const PLACEMENTS: &str = "placements/";
const RUNTIME: &str = "runtime/";
const LEADER: &str = "engine/leader";
const VERSION: &str = "version";

/// A key classified by record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    Unit(UnitName),
    Machine(MachineId),
    Placement(UnitName),
    Runtime(UnitName, MachineId),
    Leader,
    Version,
}

/// Builds and classifies keys under a root.
#[derive(Debug, Clone)]
pub struct Keys {
    /// Root with a trailing slash.
    base: String,
}

impl Keys {
    pub fn new(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            base: format!("{root}/"),
        }
    }

    /// Prefix covering every registry key.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn units(&self) -> String {
        format!("{}{UNITS}", self.base)
    }

    pub fn unit(&self, name: &UnitName) -> String {
        format!("{}{UNITS}{name}", self.base)
    }

    pub fn machines(&self) -> String {
        format!("{}{MACHINES}", self.base)
    }

    pub fn machine(&self, id: &MachineId) -> String {
        format!("{}{MACHINES}{id}", self.base)
    }

    pub fn placements(&self) -> String {
        format!("{}{PLACEMENTS}", self.base)
    }

    pub fn placement(&self, name: &UnitName) -> String {
        format!("{}{PLACEMENTS}{name}", self.base)
    }

    /// Prefix of every runtime record of one unit.
    pub fn runtime_of(&self, name: &UnitName) -> String {
        format!("{}{RUNTIME}{name}/", self.base)
    }

    pub fn runtime(&self, name: &UnitName, machine: &MachineId) -> String {
        format!("{}{RUNTIME}{name}/{machine}", self.base)
    }

    pub fn leader(&self) -> String {
        format!("{}{LEADER}", self.base)
    }

    pub fn version(&self) -> String {
        format!("{}{VERSION}", self.base)
    }

    /// Classify a full store key. Returns `None` for keys outside the layout.
    pub fn classify(&self, key: &str) -> Option<KeyRef> {
        let rest = key.strip_prefix(&self.base)?;

        if let Some(name) = rest.strip_prefix(UNITS) {
            return UnitName::parse(name).ok().map(KeyRef::Unit);
        }
        if let Some(id) = rest.strip_prefix(MACHINES) {
            return MachineId::parse(id).ok().map(KeyRef::Machine);
        }
        if let Some(name) = rest.strip_prefix(PLACEMENTS) {
            return UnitName::parse(name).ok().map(KeyRef::Placement);
        }
        if let Some(pair) = rest.strip_prefix(RUNTIME) {
            let (unit, machine) = pair.split_once('/')?;
            let unit = UnitName::parse(unit).ok()?;
            let machine = MachineId::parse(machine).ok()?;
            return Some(KeyRef::Runtime(unit, machine));
        }

        match rest {
            LEADER => Some(KeyRef::Leader),
            VERSION => Some(KeyRef::Version),
            _ => None,
        }
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}
