//! Election primitives over a namespace's member prefix.
//!
//! Each candidate owns one lease-bound key under the namespace prefix. The
//! candidate whose key has the lowest create revision is the leader; the rest
//! queue behind it in creation order. Leadership therefore hands over in
//! registration order, and a crashed leader is replaced once its lease expires.

use std::collections::BTreeMap;
use std::sync::Arc;

use conclave_kv::CoordinationStore;
use conclave_kv::CreateOutcome;
use conclave_kv::KeyValue;
use conclave_kv::LeaseId;
use futures::StreamExt;
use futures::stream::BoxStream;
use futures::stream;
use tracing::debug;

use crate::contention::front;
use crate::contention::wait_for_removal;
use crate::contention::wait_for_turn;
use crate::error::SyncError;

/// Leader records in the order they took over.
pub(crate) type LeaderStream = BoxStream<'static, Result<KeyValue, SyncError>>;

/// A registered candidacy, identified by key and create revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidacy {
    pub key: String,
    pub create_revision: u64,
}

/// Election over one namespace prefix.
#[derive(Clone)]
pub(crate) struct StoreElection {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

/// The current leader among a prefix scan.
pub(crate) fn leader_entry(entries: &[KeyValue]) -> Option<&KeyValue> {
    front(entries)
}

impl StoreElection {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, members_prefix: String) -> Self {
        Self {
            store,
            prefix: members_prefix,
        }
    }

    /// Create the candidacy key. Returns `None` if the key already exists.
    pub(crate) async fn register(&self, key: &str, value: &str, lease: LeaseId) -> Result<Option<Candidacy>, SyncError> {
        match self.store.create_if_absent(key, value, Some(lease)).await? {
            CreateOutcome::Created(kv) => Ok(Some(Candidacy {
                key: kv.key,
                create_revision: kv.create_revision,
            })),
            CreateOutcome::Exists(_) => Ok(None),
        }
    }

    /// Wait until the candidacy leads. `Ok(false)` means the candidacy vanished.
    pub(crate) async fn campaign(&self, candidacy: &Candidacy) -> Result<bool, SyncError> {
        wait_for_turn(self.store.as_ref(), &self.prefix, &candidacy.key, candidacy.create_revision).await
    }

    /// Rewrite the candidacy record in place, unless it was removed or recreated.
    pub(crate) async fn proclaim(&self, candidacy: &Candidacy, value: &str, lease: LeaseId) -> Result<bool, SyncError> {
        Ok(self
            .store
            .put_if_created_at(&candidacy.key, value, Some(lease), candidacy.create_revision)
            .await?)
    }

    /// Resolves once the candidacy key is deleted or recreated.
    pub(crate) async fn wait_withdrawn(&self, candidacy: &Candidacy) -> Result<(), SyncError> {
        wait_for_removal(self.store.as_ref(), &candidacy.key, candidacy.create_revision).await
    }

    /// The current leader's record.
    pub(crate) async fn leader(&self) -> Result<Option<KeyValue>, SyncError> {
        let range = self.store.get_prefix(&self.prefix).await?;
        Ok(leader_entry(&range.entries).cloned())
    }

    /// Withdraw the candidacy.
    pub(crate) async fn resign(&self, candidacy: &Candidacy) -> Result<(), SyncError> {
        self.store.delete(&candidacy.key).await?;
        debug!(key = %candidacy.key, "candidacy withdrawn");
        Ok(())
    }

    /// Leader changes, starting with the current leader if there is one.
    ///
    /// An item is produced whenever the leading key or its value changes. The
    /// stream ends after the first store error.
    pub(crate) async fn observe(&self) -> Result<LeaderStream, SyncError> {
        let range = self.store.get_prefix(&self.prefix).await?;
        let events = self.store.watch_prefix(&self.prefix, Some(range.revision + 1)).await?;

        let candidates: BTreeMap<String, KeyValue> =
            range.entries.into_iter().map(|kv| (kv.key.clone(), kv)).collect();
        let state = ObserveState {
            candidates,
            events,
            last: None,
            pending_initial: true,
            failed: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            if std::mem::take(&mut state.pending_initial)
                && let Some(current) = state.changed_leader()
            {
                return Some((Ok(current), state));
            }
            loop {
                match state.events.next().await? {
                    Ok(event) => {
                        if event.is_delete() {
                            state.candidates.remove(&event.kv.key);
                        } else {
                            state.candidates.insert(event.kv.key.clone(), event.kv);
                        }
                        if let Some(current) = state.changed_leader() {
                            return Some((Ok(current), state));
                        }
                    }
                    Err(err) => {
                        state.failed = true;
                        return Some((Err(err.into()), state));
                    }
                }
            }
        })
        .boxed())
    }
}

struct ObserveState {
    candidates: BTreeMap<String, KeyValue>,
    events: conclave_kv::WatchStream,
    last: Option<(String, u64)>,
    pending_initial: bool,
    failed: bool,
}

impl ObserveState {
    /// The leader, if it differs from the one last reported.
    fn changed_leader(&mut self) -> Option<KeyValue> {
        let leader = self.candidates.values().min_by_key(|kv| kv.create_revision).cloned();
        let Some(leader) = leader else {
            self.last = None;
            return None;
        };
        let marker = (leader.key.clone(), leader.mod_revision);
        if self.last.as_ref() == Some(&marker) {
            return None;
        }
        self.last = Some(marker);
        Some(leader)
    }
}
