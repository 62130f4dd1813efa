//! Configuration for the scheduling engine.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::EngineId;
use fleet_reconcile::BackoffPolicy;
use fleet_registry::ClusterVersion;

/// Version this engine build schedules for.
pub fn build_version() -> ClusterVersion {
    ClusterVersion::new(
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}

/// Scheduling engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier of this engine candidate.
    pub engine_id: EngineId,

    /// Version this engine schedules for. Passes are skipped while the
    /// cluster version is newer.
    pub version: ClusterVersion,

    /// Leader lease TTL.
    pub lease_ttl: Duration,

    /// Leader lease renewal cadence, and election retry cadence while idle.
    pub renew_interval: Duration,

    /// Full reconciliation sweep interval.
    pub sweep_interval: Duration,

    /// Backoff between failed passes.
    pub retry_backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: EngineId::new(),
            version: build_version(),
            lease_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(30),
            retry_backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(10),
                jitter: 0.25,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        // Engine ID can be provided or auto-generated
        let engine_id = std::env::var("FLEET_ENGINE_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.engine_id);

        let version = match std::env::var("FLEET_ENGINE_VERSION") {
            Ok(v) => ClusterVersion::parse(&v)
                .map_err(anyhow::Error::msg)
                .context("FLEET_ENGINE_VERSION")?,
            Err(_) => defaults.version,
        };

        let lease_ttl = secs_var("FLEET_ENGINE_LEASE_TTL").unwrap_or(defaults.lease_ttl);
        let renew_interval =
            secs_var("FLEET_ENGINE_RENEW_INTERVAL").unwrap_or(lease_ttl / 3);
        let sweep_interval =
            secs_var("FLEET_ENGINE_SWEEP_INTERVAL").unwrap_or(defaults.sweep_interval);

        anyhow::ensure!(
            renew_interval < lease_ttl,
            "renew interval ({renew_interval:?}) must be shorter than lease TTL ({lease_ttl:?})"
        );

        Ok(Self {
            engine_id,
            version,
            lease_ttl,
            renew_interval,
            sweep_interval,
            retry_backoff: defaults.retry_backoff,
        })
    }
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
