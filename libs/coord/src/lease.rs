//! Renewable lease handles.
//!
//! A `LeaseHandle` owns one key attached to one lease. Liveness is tracked
//! locally as well as in the store: the handle is valid only while
//! `now < last successful renewal + ttl`, measured from the moment the renewal
//! request was sent. A holder whose local deadline has passed must behave as
//! if it no longer holds the key, even before the store expires it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CoordError, CoordResult};
use crate::store::{LeaseId, Precondition, Store};

/// Read-only view of a lease's local validity, cheap to clone.
#[derive(Debug, Clone)]
pub struct LeaseGuard {
    deadline: watch::Receiver<Instant>,
}

impl LeaseGuard {
    /// Returns true while the lease is known to be held.
    pub fn is_valid(&self) -> bool {
        Instant::now() < *self.deadline.borrow()
    }

    /// Time left before the local deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .borrow()
            .saturating_duration_since(Instant::now())
    }
}

/// A key held under a renewable TTL lease.
pub struct LeaseHandle {
    store: Arc<dyn Store>,
    key: String,
    lease: LeaseId,
    ttl: Duration,
    deadline: watch::Sender<Instant>,
}

impl LeaseHandle {
    /// Take `key` exclusively: fails with [`CoordError::CasFailed`] if the key
    /// is already held.
    pub async fn acquire(
        store: Arc<dyn Store>,
        key: impl Into<String>,
        value: String,
        ttl: Duration,
    ) -> CoordResult<Self> {
        let key = key.into();
        let started = Instant::now();
        let lease = store.grant_lease(ttl).await?;

        if let Err(e) = store
            .compare_and_swap(&key, Precondition::Absent, value, Some(lease))
            .await
        {
            if let Err(revoke_err) = store.revoke_lease(lease).await {
                debug!(lease = %lease, error = %revoke_err, "Failed to revoke unused lease");
            }
            return Err(e);
        }

        Ok(Self::new(store, key, lease, ttl, started))
    }

    /// Write `key` under a fresh lease, replacing whatever is there.
    pub async fn attach(
        store: Arc<dyn Store>,
        key: impl Into<String>,
        value: String,
        ttl: Duration,
    ) -> CoordResult<Self> {
        let key = key.into();
        let started = Instant::now();
        let lease = store.grant_lease(ttl).await?;
        store.put(&key, value, Some(lease)).await?;
        Ok(Self::new(store, key, lease, ttl, started))
    }

    fn new(
        store: Arc<dyn Store>,
        key: String,
        lease: LeaseId,
        ttl: Duration,
        started: Instant,
    ) -> Self {
        let (deadline, _) = watch::channel(started + ttl);
        Self {
            store,
            key,
            lease,
            ttl,
            deadline,
        }
    }

    /// The key held by this lease.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The store lease ID.
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// Lease time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns true while the lease is known to be held.
    pub fn is_valid(&self) -> bool {
        Instant::now() < *self.deadline.borrow()
    }

    /// A clonable validity view for tasks that do not own the handle.
    pub fn guard(&self) -> LeaseGuard {
        LeaseGuard {
            deadline: self.deadline.subscribe(),
        }
    }

    /// Refresh the lease.
    ///
    /// On [`CoordError::LeaseExpired`] the handle is invalidated immediately.
    /// Transient failures leave the previous deadline in place.
    pub async fn renew(&self) -> CoordResult<()> {
        let started = Instant::now();
        match self.store.keep_alive(self.lease).await {
            Ok(()) => {
                self.deadline.send_replace(started + self.ttl);
                Ok(())
            }
            Err(e @ CoordError::LeaseExpired(_)) => {
                warn!(key = %self.key, lease = %self.lease, "Lease lost");
                self.invalidate();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrite the value of the held key without touching the lease.
    pub async fn update(&self, value: String) -> CoordResult<()> {
        match self.store.put(&self.key, value, Some(self.lease)).await {
            Ok(_) => Ok(()),
            Err(e @ CoordError::LeaseExpired(_)) => {
                self.invalidate();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Revoke the lease, deleting the key.
    pub async fn release(self) -> CoordResult<()> {
        self.invalidate();
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(CoordError::LeaseExpired(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn invalidate(&self) {
        self.deadline.send_replace(Instant::now());
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("ttl", &self.ttl)
            .finish()
    }
}
