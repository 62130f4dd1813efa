//! The store contract and its value types.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{CoordError, CoordResult};

/// Monotonic modification index. Every mutation in the store bumps it by one.
pub type Index = u64;

/// Identifier of a TTL lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    /// Wraps a raw lease number.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw lease number.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A stored key and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Index of the write that created the key.
    pub create_index: Index,
    /// Index of the most recent write to the key.
    pub mod_index: Index,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// A consistent listing of a prefix at a given index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Store index at which the listing was taken.
    pub index: Index,
    /// Entries under the prefix, sorted by key.
    pub entries: Vec<KeyValue>,
}

/// Expected state of a key for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The key must not exist.
    Absent,
    /// The key must hold exactly this value.
    Value(String),
}

/// Kind of mutation reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    /// The key was removed because its lease expired.
    Expire,
}

impl EventKind {
    /// Returns true if the key no longer exists after this event.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::Expire)
    }
}

/// A single mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for creates and updates.
    pub value: Option<String>,
    pub index: Index,
}

/// Coordination store contract.
///
/// Implementations must apply every mutation atomically and assign it a
/// strictly increasing [`Index`]. Raw events are published on the
/// [`subscribe`](Store::subscribe) feed in index order.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> CoordResult<Option<KeyValue>>;

    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> CoordResult<Snapshot>;

    /// Unconditionally write a key, optionally attaching it to a lease.
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> CoordResult<Index>;

    /// Write a key only if its current state matches `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Precondition,
        value: String,
        lease: Option<LeaseId>,
    ) -> CoordResult<Index>;

    /// Delete a key only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<Index>;

    /// Delete a key. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> CoordResult<bool>;

    /// Delete every key under `prefix`. Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> CoordResult<usize>;

    /// Grant a new lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> CoordResult<LeaseId>;

    /// Refresh a lease for another TTL.
    async fn keep_alive(&self, lease: LeaseId) -> CoordResult<()>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> CoordResult<()>;

    /// Subscribe to the raw mutation feed.
    ///
    /// Receivers that fall behind observe `RecvError::Lagged`; use
    /// [`watch_prefix`](crate::watch_prefix) for gap handling.
    fn subscribe(&self) -> CoordResult<broadcast::Receiver<WatchEvent>>;
}

/// Bound a store operation by `duration`.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> CoordResult<T>
where
    F: Future<Output = CoordResult<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoordError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: CoordResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(CoordError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok(5u32) }).await;
        assert_eq!(result, Ok(5));
    }

    #[test]
    fn test_event_kind_removal() {
        assert!(EventKind::Expire.is_removal());
        assert!(EventKind::Delete.is_removal());
        assert!(!EventKind::Update.is_removal());
    }
}
