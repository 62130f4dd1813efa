//! In-process coordination store.
//!
//! `MemoryStore` provides the full [`Store`] contract inside one process:
//! single-key atomicity, a global modification index, TTL leases measured on
//! the tokio clock, and a bounded broadcast feed of mutations.
//!
//! Lease expiry is applied lazily at the start of every operation and by the
//! optional background reaper, so watchers observe `expire` events even when
//! nobody else touches the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{CoordError, CoordResult};
use crate::store::{
    EventKind, Index, KeyValue, LeaseId, Precondition, Snapshot, Store, WatchEvent,
};

/// Default capacity of the mutation feed.
const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_index: Index,
    mod_index: Index,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    index: Index,
    next_lease: u64,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
}

/// In-memory implementation of [`Store`].
pub struct MemoryStore {
    state: Mutex<State>,
    feed: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store with the default feed capacity.
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create an empty store whose mutation feed retains `capacity` events.
    ///
    /// Subscribers further behind than this observe a gap and resync.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(State::default()),
            feed,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current modification index.
    pub fn index(&self) -> Index {
        self.lock().index
    }

    /// Apply lease expiry now. Returns the number of leases that expired.
    pub fn expire_leases(&self) -> usize {
        let mut state = self.lock();
        self.expire_locked(&mut state)
    }

    /// Run lease expiry on a fixed cadence until the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let expired = store.expire_leases();
                if expired > 0 {
                    debug!(expired, "Reaped expired leases");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the state after checking availability and applying expiry.
    fn enter(&self) -> CoordResult<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoordError::Unavailable("memory store offline".to_string()));
        }
        let mut state = self.lock();
        self.expire_locked(&mut state);
        Ok(state)
    }

    fn publish(&self, event: WatchEvent) {
        trace!(key = %event.key, index = event.index, kind = ?event.kind, "Publishing event");
        // No receivers is not an error.
        let _ = self.feed.send(event);
    }

    fn expire_locked(&self, state: &mut State) -> usize {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.drop_lease_locked(state, *id, EventKind::Expire);
        }
        expired.len()
    }

    fn drop_lease_locked(&self, state: &mut State, id: LeaseId, kind: EventKind) {
        let Some(lease) = state.leases.remove(&id) else {
            return;
        };
        for key in lease.keys {
            if state.entries.remove(&key).is_some() {
                state.index += 1;
                self.publish(WatchEvent {
                    kind,
                    key,
                    value: None,
                    index: state.index,
                });
            }
        }
    }

    fn write_locked(
        &self,
        state: &mut State,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> CoordResult<Index> {
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(CoordError::LeaseExpired(id));
            }
        }

        state.index += 1;
        let index = state.index;

        let previous = state.entries.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().and_then(|e| e.lease) {
            if Some(old_lease) != lease {
                if let Some(l) = state.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(l) = state.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        let create_index = previous.as_ref().map_or(index, |e| e.create_index);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                create_index,
                mod_index: index,
                lease,
            },
        );

        self.publish(WatchEvent {
            kind: if previous.is_some() {
                EventKind::Update
            } else {
                EventKind::Create
            },
            key: key.to_string(),
            value: Some(value),
            index,
        });

        Ok(index)
    }

    fn remove_locked(&self, state: &mut State, key: &str) -> Option<Index> {
        let entry = state.entries.remove(key)?;
        if let Some(id) = entry.lease {
            if let Some(l) = state.leases.get_mut(&id) {
                l.keys.remove(key);
            }
        }
        state.index += 1;
        self.publish(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: None,
            index: state.index,
        });
        Some(state.index)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_index: entry.create_index,
        mod_index: entry.mod_index,
        lease: entry.lease,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> CoordResult<Option<KeyValue>> {
        let state = self.enter()?;
        Ok(state.entries.get(key).map(|e| to_key_value(key, e)))
    }

    async fn list(&self, prefix: &str) -> CoordResult<Snapshot> {
        let state = self.enter()?;
        let entries = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| to_key_value(k, e))
            .collect();
        Ok(Snapshot {
            index: state.index,
            entries,
        })
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> CoordResult<Index> {
        let mut state = self.enter()?;
        self.write_locked(&mut state, key, value, lease)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Precondition,
        value: String,
        lease: Option<LeaseId>,
    ) -> CoordResult<Index> {
        let mut state = self.enter()?;
        let current = state.entries.get(key).map(|e| e.value.clone());

        let holds = match (&expected, &current) {
            (Precondition::Absent, None) => true,
            (Precondition::Value(want), Some(have)) => want == have,
            _ => false,
        };
        if !holds {
            return Err(CoordError::CasFailed {
                key: key.to_string(),
                current,
            });
        }

        self.write_locked(&mut state, key, value, lease)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<Index> {
        let mut state = self.enter()?;
        let current = state.entries.get(key).map(|e| e.value.clone());
        if current.as_deref() != Some(expected) {
            return Err(CoordError::CasFailed {
                key: key.to_string(),
                current,
            });
        }
        self.remove_locked(&mut state, key)
            .ok_or_else(|| CoordError::CasFailed {
                key: key.to_string(),
                current: None,
            })
    }

    async fn delete(&self, key: &str) -> CoordResult<bool> {
        let mut state = self.enter()?;
        Ok(self.remove_locked(&mut state, key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> CoordResult<usize> {
        let mut state = self.enter()?;
        let keys: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.remove_locked(&mut state, key);
        }
        Ok(keys.len())
    }

    async fn grant_lease(&self, ttl: Duration) -> CoordResult<LeaseId> {
        let mut state = self.enter()?;
        state.next_lease += 1;
        let id = LeaseId::new(state.next_lease);
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease = %id, ttl_ms = ttl.as_millis() as u64, "Granted lease");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordResult<()> {
        let mut state = self.enter()?;
        let Some(l) = state.leases.get_mut(&lease) else {
            return Err(CoordError::LeaseExpired(lease));
        };
        l.deadline = Instant::now() + l.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> CoordResult<()> {
        let mut state = self.enter()?;
        if !state.leases.contains_key(&lease) {
            return Err(CoordError::LeaseExpired(lease));
        }
        self.drop_lease_locked(&mut state, lease, EventKind::Delete);
        debug!(lease = %lease, "Revoked lease");
        Ok(())
    }

    fn subscribe(&self) -> CoordResult<broadcast::Receiver<WatchEvent>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoordError::Unavailable("memory store offline".to_string()));
        }
        Ok(self.feed.subscribe())
    }
}
