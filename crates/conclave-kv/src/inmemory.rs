//! In-memory implementation of [`CoordinationStore`] for testing.
//!
//! Provides a deterministic, non-persistent store that still honors the parts
//! of the contract the coordination layer depends on: a single store-wide
//! revision, create/mod revisions per key, leases that expire and take their
//! keys with them, and an ordered watch feed with replay from a revision.
//!
//! # Limitations
//!
//! - No persistence across restarts
//! - Single process only (no replication)
//! - Watch replay is bounded by [`MAX_WATCH_HISTORY`]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::MAX_WATCH_HISTORY;
use crate::constants::MIN_LEASE_TTL_SECS;
use crate::constants::WATCH_CHANNEL_CAPACITY;
use crate::error::CompactedSnafu;
use crate::error::EmptyKeySnafu;
use crate::error::KeyValueStoreError;
use crate::error::LeaseNotFoundSnafu;
use crate::traits::CoordinationStore;
use crate::types::CreateOutcome;
use crate::types::KeyValue;
use crate::types::LeaseGrant;
use crate::types::LeaseId;
use crate::types::RangeResult;
use crate::types::WatchEvent;
use crate::types::WatchEventType;
use crate::types::WatchStream;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_revision: u64,
    mod_revision: u64,
    version: u64,
    lease: Option<LeaseId>,
}

impl Entry {
    fn to_key_value(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        }
    }
}

#[derive(Debug)]
struct LeaseState {
    ttl_secs: u64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct StoreState {
    revision: u64,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: i64,
    history: VecDeque<WatchEvent>,
    /// Highest revision evicted from `history`.
    compacted: u64,
    events: broadcast::Sender<WatchEvent>,
}

impl StoreState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            revision: 0,
            entries: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 1,
            history: VecDeque::with_capacity(MAX_WATCH_HISTORY),
            compacted: 0,
            events,
        }
    }

    /// Revoke every lease whose deadline has passed.
    fn expire_due(&mut self, now: Instant) {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            debug!(lease = %id, "lease expired");
            self.revoke(id);
        }
    }

    fn require_lease(&self, lease: Option<LeaseId>) -> Result<(), KeyValueStoreError> {
        match lease {
            Some(lease_id) if !self.leases.contains_key(&lease_id) => LeaseNotFoundSnafu { lease_id }.fail(),
            _ => Ok(()),
        }
    }

    fn record(&mut self, event: WatchEvent) {
        if self.history.len() == MAX_WATCH_HISTORY
            && let Some(evicted) = self.history.pop_front()
        {
            self.compacted = evicted.revision;
        }
        self.history.push_back(event.clone());
        // Nobody watching is fine.
        let _ = self.events.send(event);
    }

    fn put_entry(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> KeyValue {
        self.revision += 1;
        let revision = self.revision;

        let previous_lease = self.entries.get(key).and_then(|entry| entry.lease);
        if previous_lease != lease
            && let Some(old) = previous_lease
            && let Some(state) = self.leases.get_mut(&old)
        {
            state.keys.remove(key);
        }
        if let Some(id) = lease
            && let Some(state) = self.leases.get_mut(&id)
        {
            state.keys.insert(key.to_string());
        }

        let entry = self
            .entries
            .entry(key.to_string())
            .and_modify(|entry| {
                entry.value = value.to_string();
                entry.mod_revision = revision;
                entry.version += 1;
                entry.lease = lease;
            })
            .or_insert_with(|| Entry {
                value: value.to_string(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease,
            });
        let kv = entry.to_key_value(key);

        self.record(WatchEvent {
            event_type: WatchEventType::Put,
            kv: kv.clone(),
            revision,
        });
        kv
    }

    fn delete_entry(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(id) = entry.lease
            && let Some(state) = self.leases.get_mut(&id)
        {
            state.keys.remove(key);
        }

        self.revision += 1;
        let revision = self.revision;
        self.record(WatchEvent {
            event_type: WatchEventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: entry.create_revision,
                mod_revision: revision,
                version: 0,
                lease: None,
            },
            revision,
        });
        true
    }

    /// Remove a lease and delete its keys. Returns false if it did not exist.
    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            self.delete_entry(&key);
        }
        true
    }
}

fn validate_key(key: &str) -> Result<(), KeyValueStoreError> {
    if key.is_empty() {
        return EmptyKeySnafu.fail();
    }
    Ok(())
}

/// In-memory deterministic implementation of [`CoordinationStore`].
///
/// Leases are expired both lazily (every operation first revokes overdue
/// leases) and by a background tokio task per lease, so keys disappear even
/// when nobody touches the store. Watch events are broadcast while the state
/// lock is held, which keeps every subscriber in commit order.
///
/// # Example
///
/// ```ignore
/// use conclave_kv::{CoordinationStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let lease = store.lease_grant(10).await?;
/// store.put("/svc/a", "1", Some(lease.id)).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::new())),
        }
    }
}

impl InMemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        state.leases.len()
    }

    /// Force a lease to expire now, as if its owner stopped renewing it.
    ///
    /// Returns false if the lease did not exist.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let expired = self.state.lock().revoke(lease);
        if expired {
            debug!(lease = %lease, "lease expired by request");
        }
        expired
    }

    /// Revoke the lease once its deadline passes without renewal.
    fn spawn_reaper(&self, id: LeaseId) {
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(state) = state.upgrade() else {
                        return;
                    };
                    let guard = state.lock();
                    match guard.leases.get(&id) {
                        Some(lease) => lease.deadline,
                        None => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(state) = state.upgrade() else {
                    return;
                };
                let mut guard = state.lock();
                let overdue = match guard.leases.get(&id) {
                    Some(lease) => lease.deadline <= Instant::now(),
                    None => return,
                };
                if overdue {
                    debug!(lease = %id, "lease expired");
                    guard.revoke(id);
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64, KeyValueStoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        state.require_lease(lease)?;
        Ok(state.put_entry(key, value, lease).mod_revision)
    }

    async fn put_if_created_at(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        create_revision: u64,
    ) -> Result<bool, KeyValueStoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        state.require_lease(lease)?;
        let matches = state.entries.get(key).is_some_and(|entry| entry.create_revision == create_revision);
        if matches {
            state.put_entry(key, value, lease);
        }
        Ok(matches)
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<CreateOutcome, KeyValueStoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        state.require_lease(lease)?;
        if let Some(existing) = state.entries.get(key) {
            return Ok(CreateOutcome::Exists(existing.to_key_value(key)));
        }
        Ok(CreateOutcome::Created(state.put_entry(key, value, lease)))
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        Ok(state.entries.get(key).map(|entry| entry.to_key_value(key)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResult, KeyValueStoreError> {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        let entries = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| entry.to_key_value(key))
            .collect();
        Ok(RangeResult {
            entries,
            revision: state.revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, KeyValueStoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        Ok(state.delete_entry(key))
    }

    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseGrant, KeyValueStoreError> {
        let ttl_secs = ttl_secs.max(MIN_LEASE_TTL_SECS);
        let id = {
            let mut state = self.state.lock();
            let id = LeaseId::new(state.next_lease);
            state.next_lease += 1;
            state.leases.insert(id, LeaseState {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs),
                keys: BTreeSet::new(),
            });
            id
        };
        self.spawn_reaper(id);
        debug!(lease = %id, ttl_secs, "lease granted");
        Ok(LeaseGrant { id, ttl_secs })
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<u64, KeyValueStoreError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.expire_due(now);
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + Duration::from_secs(entry.ttl_secs);
                Ok(entry.ttl_secs)
            }
            None => LeaseNotFoundSnafu { lease_id: lease }.fail(),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        if !state.revoke(lease) {
            return LeaseNotFoundSnafu { lease_id: lease }.fail();
        }
        debug!(lease = %lease, "lease revoked");
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, KeyValueStoreError> {
        let (backlog, receiver, start) = {
            let mut state = self.state.lock();
            state.expire_due(Instant::now());
            let start = start_revision.unwrap_or(state.revision + 1);
            if start <= state.compacted {
                return CompactedSnafu {
                    requested: start,
                    compacted: state.compacted,
                }
                .fail();
            }
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|event| event.revision >= start && event.kv.key.starts_with(prefix))
                .cloned()
                .collect();
            // Subscribing under the lock means no event falls between backlog and live feed.
            (backlog, state.events.subscribe(), start)
        };

        let prefix = prefix.to_string();
        let live = stream::unfold(Some(receiver), move |receiver| {
            let prefix = prefix.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if event.revision >= start && event.kv.key.starts_with(&prefix) {
                                return Some((Ok(event), Some(receiver)));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            return Some((Err(KeyValueStoreError::WatchLagged { skipped }), None));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}
