//! Membership change watcher.

use conclave_kv::WatchEvent;
use conclave_kv::WatchStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::SyncError;
use crate::error::WatcherClosedSnafu;
use crate::keys::last_segment;
use crate::keys::unescape_segment;
use crate::types::ElectEvent;
use crate::types::Member;

/// Streams membership changes of one namespace in commit order.
///
/// [`next`](Self::next) yields members as they register; departures are only
/// visible through [`next_event`](Self::next_event). [`close`](Self::close) may
/// be called from any task and wakes a pending read.
pub struct ElectWatcher {
    namespace: String,
    events: tokio::sync::Mutex<Option<WatchStream>>,
    closed: CancellationToken,
}

impl ElectWatcher {
    pub(crate) fn new(namespace: String, events: WatchStream) -> Self {
        Self {
            namespace,
            events: tokio::sync::Mutex::new(Some(events)),
            closed: CancellationToken::new(),
        }
    }

    /// Namespace being watched.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the watcher was closed or its feed ended.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Next member registration or record update.
    pub async fn next(&self) -> Result<Member, SyncError> {
        loop {
            match self.next_event().await? {
                ElectEvent::Joined(member) => return Ok(member),
                ElectEvent::Left { id, .. } => {
                    debug!(namespace = %self.namespace, id = %id, "skipping departure");
                }
            }
        }
    }

    /// Next membership change, including departures.
    ///
    /// A feed error is returned once; afterwards the watcher is closed.
    pub async fn next_event(&self) -> Result<ElectEvent, SyncError> {
        let mut guard = tokio::select! {
            _ = self.closed.cancelled() => return WatcherClosedSnafu.fail(),
            guard = self.events.lock() => guard,
        };

        loop {
            let Some(events) = guard.as_mut() else {
                return WatcherClosedSnafu.fail();
            };
            let next = tokio::select! {
                _ = self.closed.cancelled() => None,
                next = events.next() => Some(next),
            };
            let Some(next) = next else {
                guard.take();
                return WatcherClosedSnafu.fail();
            };

            match next {
                Some(Ok(event)) => {
                    if let Some(event) = self.translate(event) {
                        return Ok(event);
                    }
                }
                Some(Err(err)) => {
                    warn!(namespace = %self.namespace, error = %err, "membership feed failed");
                    guard.take();
                    self.closed.cancel();
                    return Err(err.into());
                }
                None => {
                    guard.take();
                    self.closed.cancel();
                    return WatcherClosedSnafu.fail();
                }
            }
        }
    }

    fn translate(&self, event: WatchEvent) -> Option<ElectEvent> {
        if event.is_delete() {
            return Some(ElectEvent::Left {
                namespace: self.namespace.clone(),
                id: unescape_segment(last_segment(&event.kv.key)),
            });
        }
        match Member::decode(&event.kv.key, &event.kv.value) {
            Ok(member) => Some(ElectEvent::Joined(member)),
            Err(err) => {
                warn!(key = %event.kv.key, error = %err, "skipping undecodable member record");
                None
            }
        }
    }

    /// Stop watching. Pending and later reads fail with [`SyncError::WatcherClosed`].
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // A reader holding the lock drops the feed itself when it wakes.
        if let Ok(mut guard) = self.events.try_lock() {
            guard.take();
        }
        debug!(namespace = %self.namespace, "watcher closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use conclave_kv::CoordinationStore;
    use conclave_kv::InMemoryStore;
    use conclave_kv::KeyValueStoreError;
    use futures::stream;

    use super::*;
    use crate::keys::member_key;
    use crate::keys::members_prefix;

    async fn watcher(store: &Arc<InMemoryStore>) -> ElectWatcher {
        let events = store.watch_prefix(&members_prefix("/t", "svc"), None).await.unwrap();
        ElectWatcher::new("svc".to_string(), events)
    }

    async fn join(store: &InMemoryStore, id: &str) {
        let value = Member::new("svc", id).encode().unwrap();
        store.put(&member_key("/t", "svc", id), &value, None).await.unwrap();
    }

    #[tokio::test]
    async fn next_skips_departures() {
        let store = InMemoryStore::new();
        let watcher = watcher(&store).await;

        join(&store, "a").await;
        store.delete(&member_key("/t", "svc", "a")).await.unwrap();
        join(&store, "b").await;

        let first = tokio::time::timeout(Duration::from_secs(1), watcher.next()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), watcher.next()).await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
    }

    #[tokio::test]
    async fn next_event_reports_departures_by_id() {
        let store = InMemoryStore::new();
        let watcher = watcher(&store).await;

        join(&store, "x/y").await;
        store.delete(&member_key("/t", "svc", "x/y")).await.unwrap();

        let joined = watcher.next_event().await.unwrap();
        assert!(matches!(joined, ElectEvent::Joined(ref m) if m.id == "x/y"));
        let left = watcher.next_event().await.unwrap();
        assert_eq!(left, ElectEvent::Left {
            namespace: "svc".to_string(),
            id: "x/y".to_string(),
        });
    }

    #[tokio::test]
    async fn undecodable_puts_are_skipped() {
        let store = InMemoryStore::new();
        let watcher = watcher(&store).await;

        store.put(&member_key("/t", "svc", "bad"), "nope", None).await.unwrap();
        join(&store, "good").await;

        assert_eq!(watcher.next().await.unwrap().id, "good");
    }

    #[tokio::test]
    async fn close_wakes_pending_reader() {
        let store = InMemoryStore::new();
        let watcher = Arc::new(watcher(&store).await);

        let reader = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.next().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.close();
        watcher.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(SyncError::WatcherClosed)));
        assert!(matches!(watcher.next().await, Err(SyncError::WatcherClosed)));
        assert!(watcher.is_closed());
    }

    #[tokio::test]
    async fn feed_error_is_reported_once() {
        let events = stream::iter(vec![Err(KeyValueStoreError::WatchLagged { skipped: 3 })]).boxed();
        let watcher = ElectWatcher::new("svc".to_string(), events);

        assert!(matches!(watcher.next().await, Err(SyncError::StoreUnavailable { .. })));
        assert!(matches!(watcher.next().await, Err(SyncError::WatcherClosed)));
    }
}
