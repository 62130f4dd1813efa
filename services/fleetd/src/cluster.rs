//! Cluster file: the machines to simulate and the units to submit.
//!
//! ```toml
//! [agent]
//! lease_ttl_secs = 15
//!
//! [[machines]]
//! id = "m1"
//! metadata = { region = "us-east" }
//!
//! [[units]]
//! name = "web.service"
//! definition = "ExecStart=/usr/bin/web"
//! require = "region=us-east"
//! conflicts = ["web.*"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_agent::AgentConfig;
use fleet_id::{MachineId, UnitName};
use fleet_registry::{parse_requirements, TargetState, Unit};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub machines: Vec<MachineSpec>,

    #[serde(default)]
    pub units: Vec<UnitSpec>,
}

/// Timing shared by every simulated agent.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettings {
    pub lease_ttl_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub reconcile_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineSpec {
    pub id: String,

    #[serde(default)]
    pub public_ip: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    pub name: String,

    /// Inline unit definition.
    #[serde(default)]
    pub definition: Option<String>,

    /// Definition file, relative to the cluster file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Requirement string, `key=value,...`.
    #[serde(default)]
    pub require: Option<String>,

    #[serde(default)]
    pub conflicts: Vec<String>,

    #[serde(default)]
    pub target: Option<TargetState>,
}

impl ClusterFile {
    /// Read and parse a cluster file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cluster file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid cluster file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let cluster: Self = toml::from_str(contents).context("invalid cluster TOML")?;

        let mut seen = BTreeSet::new();
        for machine in &cluster.machines {
            if !seen.insert(machine.id.as_str()) {
                bail!("duplicate machine {:?}", machine.id);
            }
        }
        Ok(cluster)
    }

    /// One agent configuration per machine.
    pub fn agent_configs(&self) -> Result<Vec<AgentConfig>> {
        self.machines
            .iter()
            .map(|spec| {
                let id = MachineId::parse(&spec.id)
                    .with_context(|| format!("invalid machine id {:?}", spec.id))?;
                let mut config = AgentConfig::new(id);
                if let Some(ip) = &spec.public_ip {
                    config.public_ip = ip.clone();
                }
                config.metadata = spec.metadata.clone();
                self.agent.apply(&mut config);
                Ok(config)
            })
            .collect()
    }

    /// Units to submit. Definition paths resolve against `base_dir`.
    pub fn units(&self, base_dir: &Path) -> Result<Vec<Unit>> {
        self.units
            .iter()
            .map(|spec| spec.to_unit(base_dir))
            .collect()
    }
}

impl AgentSettings {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(ttl) = self.lease_ttl_secs {
            config.lease_ttl = Duration::from_secs(ttl);
            config.heartbeat_interval = config.lease_ttl / 3;
        }
        if let Some(interval) = self.heartbeat_interval_secs {
            config.heartbeat_interval = Duration::from_secs(interval);
        }
        if let Some(interval) = self.reconcile_interval_secs {
            config.reconcile_interval = Duration::from_secs(interval);
        }
    }
}

impl UnitSpec {
    fn to_unit(&self, base_dir: &Path) -> Result<Unit> {
        let name = UnitName::parse(&self.name)
            .with_context(|| format!("invalid unit name {:?}", self.name))?;

        let definition = match (&self.definition, &self.path) {
            (Some(definition), None) => definition.clone(),
            (None, Some(path)) => {
                let path = base_dir.join(path);
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read unit file {}", path.display()))?
            }
            (Some(_), Some(_)) => bail!("unit {name}: set either definition or path, not both"),
            (None, None) => bail!("unit {name}: missing definition or path"),
        };

        let mut unit = Unit::new(name, definition);
        if let Some(require) = &self.require {
            unit.requirements = parse_requirements(require);
        }
        unit.conflicts = self.conflicts.clone();
        if let Some(target) = self.target {
            unit.target_state = target;
        }
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CLUSTER: &str = r#"
        [agent]
        lease_ttl_secs = 9

        [[machines]]
        id = "m1"
        metadata = { region = "us-east" }

        [[machines]]
        id = "m2"
        public_ip = "10.0.0.2"

        [[units]]
        name = "web.service"
        definition = "ExecStart=/usr/bin/web"
        require = "region=us-east,region=us-west"
        conflicts = ["web.*"]

        [[units]]
        name = "batch.service"
        definition = "ExecStart=/usr/bin/batch"
        target = "loaded"
    "#;

    #[test]
    fn test_parse_cluster() {
        let cluster = ClusterFile::parse(CLUSTER).unwrap();

        let configs = cluster.agent_configs().unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].metadata.get("region").map(String::as_str), Some("us-east"));
        assert_eq!(configs[1].public_ip, "10.0.0.2");
        assert_eq!(configs[1].lease_ttl, Duration::from_secs(9));
        assert!(configs[1].heartbeat_interval < configs[1].lease_ttl);

        let units = cluster.units(Path::new(".")).unwrap();
        assert_eq!(units[0].requirements["region"], vec!["us-east", "us-west"]);
        assert_eq!(units[0].conflicts, vec!["web.*"]);
        assert_eq!(units[0].target_state, TargetState::Launched);
        assert_eq!(units[1].target_state, TargetState::Loaded);
    }

    #[rstest]
    #[case("[[machines]]\nid = \"m1\"\n[[machines]]\nid = \"m1\"\n")]
    #[case("[[machines]]\nid = \"m1\"\nzone = \"a\"\n")]
    #[case("units = 3\n")]
    fn test_rejects_bad_cluster(#[case] contents: &str) {
        assert!(ClusterFile::parse(contents).is_err());
    }

    #[rstest]
    #[case("[[units]]\nname = \"web.service\"\n")]
    #[case("[[units]]\nname = \"web.service\"\ndefinition = \"x\"\npath = \"web.service\"\n")]
    #[case("[[units]]\nname = \"\"\ndefinition = \"x\"\n")]
    fn test_rejects_bad_unit(#[case] contents: &str) {
        let cluster = ClusterFile::parse(contents).unwrap();
        assert!(cluster.units(Path::new(".")).is_err());
    }
}
