//! Prefix watches with gap detection.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::error::CoordResult;
use crate::store::{Index, Snapshot, Store, WatchEvent};

/// An item produced by a [`Watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUpdate {
    /// Full state of the prefix. Sent first, and again after a gap.
    Snapshot(Snapshot),
    /// A single mutation under the prefix.
    Event(WatchEvent),
}

/// Ordered stream of changes under one prefix.
///
/// Events at or below the index of the last snapshot are dropped, so a
/// consumer never sees a mutation twice. When the underlying feed reports
/// lost events the watch re-lists the prefix and emits a new snapshot.
pub struct Watch {
    store: Arc<dyn Store>,
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
    last_index: Index,
    pending: Option<Snapshot>,
    needs_resync: bool,
}

/// Open a watch on `prefix`.
///
/// Subscribes before listing so no mutation between the two is lost.
pub async fn watch_prefix(store: Arc<dyn Store>, prefix: impl Into<String>) -> CoordResult<Watch> {
    let prefix = prefix.into();
    let rx = store.subscribe()?;
    let snapshot = store.list(&prefix).await?;

    Ok(Watch {
        store,
        prefix,
        rx,
        last_index: snapshot.index,
        pending: Some(snapshot),
        needs_resync: false,
    })
}

impl Watch {
    /// The watched prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Index of the last snapshot or event delivered.
    pub fn index(&self) -> Index {
        self.last_index
    }

    /// Wait for the next update.
    ///
    /// Returns `Ok(None)` if the mutation feed is closed. An error means the
    /// resync after a gap failed; the next call retries it.
    pub async fn next(&mut self) -> CoordResult<Option<WatchUpdate>> {
        if let Some(snapshot) = self.pending.take() {
            return Ok(Some(WatchUpdate::Snapshot(snapshot)));
        }

        if self.needs_resync {
            return self.resync().await.map(Some);
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.index <= self.last_index {
                        continue;
                    }
                    self.last_index = event.index;
                    if event.key.starts_with(&self.prefix) {
                        return Ok(Some(WatchUpdate::Event(event)));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        prefix = %self.prefix,
                        missed,
                        last_index = self.last_index,
                        "Watch fell behind, resyncing prefix"
                    );
                    self.needs_resync = true;
                    return self.resync().await.map(Some);
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Re-list the prefix and reset the watch position.
    pub async fn resync(&mut self) -> CoordResult<WatchUpdate> {
        let snapshot = self.store.list(&self.prefix).await?;
        self.last_index = snapshot.index;
        self.needs_resync = false;
        Ok(WatchUpdate::Snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::EventKind;

    #[tokio::test]
    async fn test_snapshot_then_events() {
        let store = Arc::new(MemoryStore::new());
        store.put("/units/a", "1".into(), None).await.unwrap();

        let mut watch = watch_prefix(store.clone(), "/units/").await.unwrap();

        let Some(WatchUpdate::Snapshot(snap)) = watch.next().await.unwrap() else {
            panic!("expected snapshot first");
        };
        assert_eq!(snap.entries.len(), 1);

        store.put("/machines/m1", "x".into(), None).await.unwrap();
        store.put("/units/b", "2".into(), None).await.unwrap();

        let Some(WatchUpdate::Event(event)) = watch.next().await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.key, "/units/b");
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(watch.index(), event.index);
    }

    #[tokio::test]
    async fn test_gap_triggers_resync() {
        let store = Arc::new(MemoryStore::with_feed_capacity(2));
        let mut watch = watch_prefix(store.clone(), "/units/").await.unwrap();
        let _ = watch.next().await.unwrap();

        for i in 0..10 {
            store
                .put(&format!("/units/u{i}"), "v".into(), None)
                .await
                .unwrap();
        }

        let Some(WatchUpdate::Snapshot(snap)) = watch.next().await.unwrap() else {
            panic!("expected resync snapshot after gap");
        };
        assert_eq!(snap.entries.len(), 10);
        assert_eq!(watch.index(), store.index());
    }

    #[tokio::test]
    async fn test_deleting_missing_key_emits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut watch = watch_prefix(store.clone(), "/").await.unwrap();
        let _ = watch.next().await.unwrap();

        assert!(!store.delete("/missing").await.unwrap());
        store.put("/x", "1".into(), None).await.unwrap();

        let Some(WatchUpdate::Event(event)) = watch.next().await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.key, "/x");
        assert_eq!(watch.prefix(), "/");
    }
}
