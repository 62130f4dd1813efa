//! Leader election over the engine lease.
//!
//! Exactly one engine candidate holds the leader key at a time. The holder
//! renews on a fixed cadence; if renewal reports the lease gone, or the local
//! deadline passes without a successful renewal, the engine steps down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_coord::{with_timeout, LeaseGuard, LeaseHandle};
use fleet_id::EngineId;
use fleet_registry::SchedulerRegistry;
use tracing::{debug, info, warn};

use crate::error::EngineResult;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not the leader; periodically tries to acquire the lease.
    Idle,
    /// Leader, waiting for registry events or the sweep timer.
    Watching,
    /// Leader, running a reconciliation pass.
    Scheduling,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Watching => "watching",
            Self::Scheduling => "scheduling",
        };
        f.write_str(s)
    }
}

/// This candidate's hold on the leader lease.
pub struct Leadership {
    registry: Arc<dyn SchedulerRegistry>,
    engine_id: EngineId,
    ttl: Duration,
    lease: Option<LeaseHandle>,
}

impl Leadership {
    pub fn new(registry: Arc<dyn SchedulerRegistry>, engine_id: EngineId, ttl: Duration) -> Self {
        Self {
            registry,
            engine_id,
            ttl,
            lease: None,
        }
    }

    /// Returns true while the lease is held and locally valid.
    pub fn is_leader(&self) -> bool {
        self.lease.as_ref().is_some_and(LeaseHandle::is_valid)
    }

    /// Returns true if a lease is still held but its local deadline passed.
    pub fn has_lapsed(&self) -> bool {
        self.lease.as_ref().is_some_and(|lease| !lease.is_valid())
    }

    /// Validity view for the reconciler, if leader.
    pub fn guard(&self) -> Option<LeaseGuard> {
        self.lease.as_ref().map(LeaseHandle::guard)
    }

    /// Try to take the leader lease. Returns true if this engine is now leader.
    pub async fn try_acquire(&mut self) -> EngineResult<bool> {
        if self.is_leader() {
            return Ok(true);
        }
        self.lease = self
            .registry
            .acquire_leadership(&self.engine_id, self.ttl)
            .await?;
        if self.lease.is_none() {
            debug!(engine = %self.engine_id, "Leader lease held by another engine");
        }
        Ok(self.lease.is_some())
    }

    /// Renew the lease. Returns false if leadership was lost.
    pub async fn renew(&mut self) -> bool {
        let Some(lease) = &self.lease else {
            return false;
        };

        match with_timeout(self.ttl / 2, lease.renew()).await {
            Ok(()) => return true,
            Err(e) if e.is_transient() => {
                warn!(engine = %self.engine_id, error = %e, "Failed to renew leader lease");
            }
            Err(e) => {
                warn!(engine = %self.engine_id, error = %e, "Leader lease lost");
            }
        }

        if lease.is_valid() {
            return true;
        }
        self.lease = None;
        false
    }

    /// Give up the lease so another candidate can take over promptly.
    pub async fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match lease.release().await {
            Ok(()) => info!(engine = %self.engine_id, "Released engine leadership"),
            Err(e) => warn!(engine = %self.engine_id, error = %e, "Failed to release leader lease"),
        }
    }

    /// Forget the lease without contacting the store.
    pub fn abandon(&mut self) {
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_coord::MemoryStore;
    use fleet_registry::{Registry, RegistryConfig};

    fn registry(store: Arc<MemoryStore>) -> Arc<dyn SchedulerRegistry> {
        Arc::new(Registry::new(store, RegistryConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_and_handover() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(6);
        let mut a = Leadership::new(registry(store.clone()), EngineId::new(), ttl);
        let mut b = Leadership::new(registry(store.clone()), EngineId::new(), ttl);

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        a.release().await;
        assert!(!a.is_leader());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_steps_down() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(6);
        let mut a = Leadership::new(registry(store.clone()), EngineId::new(), ttl);
        let mut b = Leadership::new(registry(store.clone()), EngineId::new(), ttl);

        assert!(a.try_acquire().await.unwrap());
        let guard = a.guard().unwrap();

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!guard.is_valid());
        assert!(a.has_lapsed());
        assert!(!a.renew().await);
        assert!(!a.is_leader());
        assert!(!a.has_lapsed());

        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_renew_failure_keeps_leadership_until_deadline() {
        let store = Arc::new(MemoryStore::new());
        let mut a = Leadership::new(registry(store.clone()), EngineId::new(), Duration::from_secs(6));
        assert!(a.try_acquire().await.unwrap());

        store.set_available(false);
        assert!(a.renew().await);

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!a.renew().await);
    }
}
