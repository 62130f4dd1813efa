//! Heartbeat loop keeping the machine record alive.
//!
//! The agent holds its machine record under a lease and renews it on a
//! cadence shorter than the TTL. When the lease is gone (expired during a
//! partition, or revoked), the agent registers again with a fresh lease and
//! asks the reconciler for a full pass, since the engine may have moved units
//! away in the meantime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_coord::{CoordError, LeaseHandle};
use fleet_registry::{AgentRegistry, Machine, RegistryResult};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;

/// Result of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Existing lease renewed.
    Renewed,
    /// Machine record written under a new lease.
    Registered,
}

/// Machine registration and its lease.
pub struct MachineLease {
    registry: Arc<dyn AgentRegistry>,
    machine: Machine,
    ttl: Duration,
    lease: Option<LeaseHandle>,
}

impl MachineLease {
    pub fn new(registry: Arc<dyn AgentRegistry>, machine: Machine, ttl: Duration) -> Self {
        Self {
            registry,
            machine,
            ttl,
            lease: None,
        }
    }

    /// Returns true while the lease is held and locally valid.
    pub fn is_registered(&self) -> bool {
        self.lease.as_ref().is_some_and(LeaseHandle::is_valid)
    }

    /// Renew the lease, registering again if it is gone.
    ///
    /// A lease that lapsed locally is revoked before registering again, so the
    /// store never carries two leases for one machine.
    pub async fn beat(&mut self) -> RegistryResult<Beat> {
        if let Some(lease) = self.lease.take() {
            match lease.renew().await {
                Ok(()) if lease.is_valid() => {
                    self.lease = Some(lease);
                    return Ok(Beat::Renewed);
                }
                Ok(()) => {
                    warn!(machine = %self.machine.id, "Machine lease renewed too late, re-registering");
                    self.revoke(lease).await;
                }
                Err(CoordError::LeaseExpired(id)) => {
                    warn!(machine = %self.machine.id, lease = %id, "Machine lease lost, re-registering");
                }
                Err(e) if lease.is_valid() => {
                    self.lease = Some(lease);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(machine = %self.machine.id, error = %e, "Machine lease lapsed, re-registering");
                    self.revoke(lease).await;
                }
            }
        }

        let lease = self.registry.register_machine(&self.machine, self.ttl).await?;
        self.lease = Some(lease);
        Ok(Beat::Registered)
    }

    async fn revoke(&self, lease: LeaseHandle) {
        let id = lease.lease_id();
        if let Err(e) = lease.release().await {
            debug!(machine = %self.machine.id, lease = %id, error = %e, "Failed to revoke lapsed lease");
        }
    }

    /// Revoke the lease so the engine reschedules promptly.
    pub async fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match lease.release().await {
            Ok(()) => info!(machine = %self.machine.id, "Machine lease revoked"),
            Err(e) => warn!(machine = %self.machine.id, error = %e, "Failed to revoke machine lease"),
        }
    }
}

/// Run the heartbeat loop until shutdown.
///
/// `resync` is notified whenever the machine registers under a new lease.
pub async fn run_heartbeat_loop(
    registry: Arc<dyn AgentRegistry>,
    config: AgentConfig,
    resync: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        machine = %config.machine_id,
        interval_secs = config.heartbeat_interval.as_secs(),
        lease_ttl_secs = config.lease_ttl.as_secs(),
        "Starting heartbeat loop"
    );

    let mut lease = MachineLease::new(registry, config.machine(), config.lease_ttl);
    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match lease.beat().await {
                    Ok(Beat::Renewed) => {
                        consecutive_failures = 0;
                        debug!("Heartbeat acknowledged");
                    }
                    Ok(Beat::Registered) => {
                        consecutive_failures = 0;
                        info!(machine = %config.machine_id, "Machine registered");
                        resync.notify_one();
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    lease.release().await;
    Ok(())
}
