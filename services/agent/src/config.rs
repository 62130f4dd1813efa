//! Configuration for the machine agent.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::MachineId;
use fleet_reconcile::{BackoffPolicy, RetryPolicy, DEFAULT_RECONCILE_INTERVAL};
use fleet_registry::Machine;

/// Machine agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier this machine registers under.
    pub machine_id: MachineId,

    /// Address published in the machine record.
    pub public_ip: String,

    /// Tags matched against unit requirements.
    pub metadata: BTreeMap<String, String>,

    /// Machine lease TTL.
    pub lease_ttl: Duration,

    /// Lease renewal cadence. Must be shorter than the TTL.
    pub heartbeat_interval: Duration,

    /// Full reconciliation sweep interval.
    pub reconcile_interval: Duration,

    /// Runtime status polling interval for launched units.
    pub health_check_interval: Duration,

    /// Bounds on each runtime state report.
    pub report_retry: RetryPolicy,
}

impl AgentConfig {
    /// Defaults for `machine_id`.
    pub fn new(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            public_ip: "127.0.0.1".to_string(),
            metadata: BTreeMap::new(),
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            health_check_interval: Duration::from_secs(10),
            report_retry: RetryPolicy {
                backoff: BackoffPolicy {
                    base: Duration::from_millis(100),
                    max: Duration::from_secs(2),
                    jitter: 0.25,
                },
                max_attempts: 3,
            },
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let machine_id = std::env::var("FLEET_MACHINE_ID").context("FLEET_MACHINE_ID is not set")?;
        let machine_id = MachineId::parse(&machine_id).context("FLEET_MACHINE_ID")?;
        let mut config = Self::new(machine_id);

        if let Ok(ip) = std::env::var("FLEET_PUBLIC_IP") {
            config.public_ip = ip;
        }
        if let Ok(raw) = std::env::var("FLEET_METADATA") {
            config.metadata = parse_metadata(&raw).context("FLEET_METADATA")?;
        }

        config.lease_ttl = secs_var("FLEET_AGENT_TTL").unwrap_or(config.lease_ttl);
        config.heartbeat_interval =
            secs_var("FLEET_HEARTBEAT_INTERVAL").unwrap_or(config.lease_ttl / 3);
        config.reconcile_interval =
            secs_var("FLEET_RECONCILE_INTERVAL").unwrap_or(config.reconcile_interval);
        config.health_check_interval =
            secs_var("FLEET_HEALTH_CHECK_INTERVAL").unwrap_or(config.health_check_interval);

        anyhow::ensure!(
            config.heartbeat_interval < config.lease_ttl,
            "heartbeat interval ({:?}) must be shorter than lease TTL ({:?})",
            config.heartbeat_interval,
            config.lease_ttl
        );

        Ok(config)
    }

    /// The record this agent registers.
    pub fn machine(&self) -> Machine {
        Machine {
            id: self.machine_id.clone(),
            public_ip: self.public_ip.clone(),
            metadata: self.metadata.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Parse `key=value,key=value` machine tags.
pub fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got {pair:?}"))?;
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "empty metadata key in {pair:?}");
        metadata.insert(key.to_string(), value.trim().to_string());
    }
    Ok(metadata)
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_metadata() {
        let metadata = parse_metadata("region=us-east, disk = ssd,").unwrap();
        assert_eq!(metadata.get("region").map(String::as_str), Some("us-east"));
        assert_eq!(metadata.get("disk").map(String::as_str), Some("ssd"));
        assert_eq!(metadata.len(), 2);
    }

    #[rstest]
    #[case("region")]
    #[case("=us-east")]
    fn test_parse_metadata_rejects(#[case] raw: &str) {
        assert!(parse_metadata(raw).is_err());
    }

    #[test]
    fn test_defaults_renew_before_expiry() {
        let config = AgentConfig::new(MachineId::parse("m1").unwrap());
        assert!(config.heartbeat_interval < config.lease_ttl);
        assert_eq!(config.machine().id.as_str(), "m1");
    }
}
