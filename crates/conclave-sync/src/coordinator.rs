//! The coordination entry point.
//!
//! A [`Coordinator`] binds a [`CoordinationStore`] to a [`SyncConfig`] and
//! hands out locks, election candidacies, membership listings and watchers.
//! Held locks are tracked in a local table keyed by lock name so `unlock`
//! needs nothing but the name.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use conclave_kv::CoordinationStore;
use conclave_kv::InMemoryStore;
use conclave_kv::KeyValueStoreError;
use conclave_kv::LeaseId;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::SyncConfig;
use crate::contention::front;
use crate::error::LockNotFoundSnafu;
use crate::error::LockTimeoutSnafu;
use crate::error::SyncError;
use crate::keys::lock_prefix;
use crate::keys::members_prefix;
use crate::leadership::Leadership;
use crate::members;
use crate::mutex::StoreMutex;
use crate::options::LeaderOptions;
use crate::options::ListMembersOptions;
use crate::options::LockOptions;
use crate::options::WatchElectOptions;
use crate::session::Session;
use crate::types::LockRecord;
use crate::types::Member;
use crate::watcher::ElectWatcher;

struct LockEntry {
    session: Session,
    mutex: StoreMutex,
}

/// Marks a lease as belonging to a `lock` call still in progress.
struct PendingLease<'a> {
    pending: &'a Mutex<HashSet<LeaseId>>,
    lease: LeaseId,
}

impl<'a> PendingLease<'a> {
    fn new(pending: &'a Mutex<HashSet<LeaseId>>, lease: LeaseId) -> Self {
        pending.lock().insert(lease);
        Self { pending, lease }
    }
}

impl Drop for PendingLease<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.lease);
    }
}

/// Distributed locks, leader election and membership over one store.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    config: SyncConfig,
    prefix: String,
    backend: &'static str,
    locks: Mutex<HashMap<String, LockEntry>>,
    pending: Mutex<HashSet<LeaseId>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("backend", &self.backend)
            .field("prefix", &self.prefix)
            .field("holder_id", &self.config.holder_id)
            .field("held_locks", &self.locks.lock().len())
            .finish()
    }
}

impl Coordinator {
    /// Coordinate over `store`.
    pub fn new<S>(store: Arc<S>, config: SyncConfig) -> Result<Self, SyncError>
    where
        S: CoordinationStore + 'static,
    {
        Self::from_dyn(store, config, "custom")
    }

    /// Coordinate over an already type-erased store, labelled `backend` in logs.
    pub fn from_dyn(
        store: Arc<dyn CoordinationStore>,
        config: SyncConfig,
        backend: &'static str,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let prefix = config.key_prefix();
        info!(backend, prefix = %prefix, holder_id = %config.holder_id, "coordinator ready");
        Ok(Self {
            store,
            config,
            prefix,
            backend,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        })
    }

    /// Coordinate over a fresh single-process store.
    pub fn in_memory(config: SyncConfig) -> Result<Self, SyncError> {
        Self::from_dyn(InMemoryStore::new(), config, "memory")
    }

    /// Connect to the etcd cluster named by `config.nodes`.
    #[cfg(feature = "etcd")]
    pub async fn connect_etcd(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let credentials = config.auth.as_ref().map(|auth| conclave_kv::EtcdCredentials {
            username: auth.username.clone(),
            password: auth.password.clone(),
        });
        let store = conclave_kv::EtcdStore::connect(&config.endpoints(), credentials).await?;
        Self::from_dyn(Arc::new(store), config, "etcd")
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Backend label, such as `memory` or `etcd`.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// The underlying store.
    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    /// Acquire the named lock, waiting at most `options.wait`.
    ///
    /// The wait bound covers opening the session as well as queueing. The
    /// lock stays held until [`unlock`](Self::unlock) or until this
    /// coordinator stops renewing its session. Dropping the returned future
    /// abandons the attempt and revokes its session in the background.
    pub async fn lock(&self, id: &str, options: LockOptions) -> Result<(), SyncError> {
        let deadline = options.wait.map(|wait| Instant::now() + wait);
        let open = Session::open(self.store.clone(), options.resolved_ttl_secs());
        let opened = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, open).await,
            None => Ok(open.await),
        };
        let session = match opened {
            Ok(session) => session?,
            Err(_) => return lock_timed_out(id, &options),
        };

        let pending = PendingLease::new(&self.pending, session.lease());
        let mutex = StoreMutex::new(self.store.clone(), lock_prefix(&self.prefix, id), session.lease());
        let record = LockRecord {
            owner: self.config.holder_id.clone(),
            lock: id.to_string(),
        };

        let acquired = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, mutex.lock(&record)).await {
                Ok(result) => result,
                Err(_) => {
                    close_quietly(&session, id).await;
                    return lock_timed_out(id, &options);
                }
            },
            None => mutex.lock(&record).await,
        };
        if let Err(err) = acquired {
            close_quietly(&session, id).await;
            return Err(err);
        }

        let stale = self.locks.lock().insert(id.to_string(), LockEntry { session, mutex });
        drop(pending);
        if let Some(stale) = stale {
            warn!(
                lock = %id,
                lease = %stale.session.lease(),
                expired = stale.session.is_expired(),
                "replacing stale lock entry"
            );
            close_quietly(&stale.session, id).await;
        }
        info!(lock = %id, "lock acquired");
        Ok(())
    }

    /// Release the named lock.
    ///
    /// If the local table has no entry, the store is checked for a record
    /// written under this coordinator's `holder_id` that currently holds the
    /// lock, and that record is removed instead. Queued attempts are never
    /// touched. Fails with [`SyncError::LockNotFound`] when there is nothing
    /// to release.
    pub async fn unlock(&self, id: &str) -> Result<(), SyncError> {
        let entry = self.locks.lock().remove(id);
        let Some(LockEntry { session, mutex }) = entry else {
            return self.recover_lock(id).await;
        };

        let released = mutex.unlock().await;
        let closed = session.close().await;
        info!(lock = %id, "lock released");
        released?;
        closed
    }

    async fn recover_lock(&self, id: &str) -> Result<(), SyncError> {
        let range = self.store.get_prefix(&lock_prefix(&self.prefix, id)).await?;
        let Some(holder) = front(&range.entries) else {
            return LockNotFoundSnafu { id }.fail();
        };
        let record = match LockRecord::decode(&holder.key, &holder.value) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %holder.key, error = %err, "undecodable lock holder record");
                return LockNotFoundSnafu { id }.fail();
            }
        };
        if record.owner != self.config.holder_id {
            return LockNotFoundSnafu { id }.fail();
        }
        // A lock call in this process is about to be granted this record.
        if let Some(lease) = holder.lease
            && self.pending.lock().contains(&lease)
        {
            return LockNotFoundSnafu { id }.fail();
        }

        self.store.delete(&holder.key).await?;
        if let Some(lease) = holder.lease {
            match self.store.lease_revoke(lease).await {
                Ok(()) | Err(KeyValueStoreError::LeaseNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        warn!(lock = %id, key = %holder.key, "released lock holder missing from the local table");
        Ok(())
    }

    /// Whether this coordinator currently holds the named lock.
    pub fn is_locked(&self, id: &str) -> bool {
        self.locks.lock().contains_key(id)
    }

    /// Names of the locks this coordinator holds, sorted.
    pub fn held_locks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.locks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register as a candidate and start campaigning in the background.
    pub async fn leader(&self, options: LeaderOptions) -> Result<Leadership, SyncError> {
        Leadership::start(self.store.clone(), &self.prefix, &options).await
    }

    /// Current members of a namespace with their roles.
    pub async fn list_members(&self, options: ListMembersOptions) -> Result<Vec<Member>, SyncError> {
        members::list_members(self.store.as_ref(), &self.prefix, &options.resolved_namespace()).await
    }

    /// Watch membership changes of a namespace, starting now.
    pub async fn watch_elect(&self, options: WatchElectOptions) -> Result<ElectWatcher, SyncError> {
        let namespace = options.resolved_namespace();
        let prefix = members_prefix(&self.prefix, &namespace);
        let events = self.store.watch_prefix(&prefix, None).await?;
        debug!(namespace = %namespace, "membership watch started");
        Ok(ElectWatcher::new(namespace, events))
    }
}

fn lock_timed_out(id: &str, options: &LockOptions) -> Result<(), SyncError> {
    let wait_ms = options.wait.map(|wait| wait.as_millis() as u64).unwrap_or_default();
    debug!(lock = %id, wait_ms, "lock wait elapsed");
    LockTimeoutSnafu { id, wait_ms }.fail()
}

async fn close_quietly(session: &Session, id: &str) {
    if let Err(err) = session.close().await {
        warn!(lock = %id, lease = %session.lease(), error = %err, "failed to close lock session");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use conclave_kv::CreateOutcome;
    use conclave_kv::KeyValue;
    use conclave_kv::LeaseGrant;
    use conclave_kv::RangeResult;
    use conclave_kv::WatchStream;

    use super::*;

    /// Delegates to an in-memory store, except that lease grants never finish.
    struct StalledGrants(Arc<InMemoryStore>);

    #[async_trait]
    impl CoordinationStore for StalledGrants {
        async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64, KeyValueStoreError> {
            self.0.put(key, value, lease).await
        }

        async fn put_if_created_at(
            &self,
            key: &str,
            value: &str,
            lease: Option<LeaseId>,
            create_revision: u64,
        ) -> Result<bool, KeyValueStoreError> {
            self.0.put_if_created_at(key, value, lease, create_revision).await
        }

        async fn create_if_absent(
            &self,
            key: &str,
            value: &str,
            lease: Option<LeaseId>,
        ) -> Result<CreateOutcome, KeyValueStoreError> {
            self.0.create_if_absent(key, value, lease).await
        }

        async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError> {
            self.0.get(key).await
        }

        async fn get_prefix(&self, prefix: &str) -> Result<RangeResult, KeyValueStoreError> {
            self.0.get_prefix(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<bool, KeyValueStoreError> {
            self.0.delete(key).await
        }

        async fn lease_grant(&self, _ttl_secs: u64) -> Result<LeaseGrant, KeyValueStoreError> {
            futures::future::pending().await
        }

        async fn lease_keep_alive(&self, lease: LeaseId) -> Result<u64, KeyValueStoreError> {
            self.0.lease_keep_alive(lease).await
        }

        async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
            self.0.lease_revoke(lease).await
        }

        async fn watch_prefix(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, KeyValueStoreError> {
            self.0.watch_prefix(prefix, start_revision).await
        }
    }

    fn coordinator() -> (Arc<InMemoryStore>, Coordinator) {
        let store = InMemoryStore::new();
        let config = SyncConfig::default().with_prefix("/t").with_holder_id("holder-1");
        let coordinator = Coordinator::new(store.clone(), config).unwrap();
        (store, coordinator)
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let (store, coordinator) = coordinator();
        coordinator.lock("jobs", LockOptions::default()).await.unwrap();
        assert!(coordinator.is_locked("jobs"));
        assert_eq!(coordinator.held_locks(), vec!["jobs".to_string()]);
        assert_eq!(store.get_prefix("/t/locks/jobs/").await.unwrap().entries.len(), 1);

        coordinator.unlock("jobs").await.unwrap();
        assert!(!coordinator.is_locked("jobs"));
        assert!(store.get_prefix("/t/locks/jobs/").await.unwrap().entries.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn unlock_unknown_lock_fails() {
        let (_store, coordinator) = coordinator();
        let err = coordinator.unlock("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::LockNotFound { ref id } if id == "missing"));
    }

    #[tokio::test]
    async fn timeout_cleans_up_claim() {
        let (store, coordinator) = coordinator();
        coordinator.lock("jobs", LockOptions::default()).await.unwrap();

        let other = Coordinator::new(store.clone(), SyncConfig::default().with_prefix("/t")).unwrap();
        let err = other
            .lock("jobs", LockOptions::default().wait(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { wait_ms: 100, .. }));
        assert!(err.is_retryable());

        // Only the holder's claim remains.
        assert_eq!(store.get_prefix("/t/locks/jobs/").await.unwrap().entries.len(), 1);
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn unlock_recovers_records_missing_from_table() {
        let (store, coordinator) = coordinator();
        coordinator.lock("jobs", LockOptions::default()).await.unwrap();

        // A second coordinator with the same holder id has no table entry.
        let config = SyncConfig::default().with_prefix("/t").with_holder_id("holder-1");
        let restarted = Coordinator::new(store.clone(), config).unwrap();
        restarted.unlock("jobs").await.unwrap();
        assert!(store.get_prefix("/t/locks/jobs/").await.unwrap().entries.is_empty());

        // Foreign records are left alone.
        let stranger = Coordinator::new(store.clone(), SyncConfig::default().with_prefix("/t")).unwrap();
        stranger.lock("jobs", LockOptions::default()).await.unwrap();
        assert!(matches!(restarted.unlock("jobs").await, Err(SyncError::LockNotFound { .. })));
    }

    #[tokio::test]
    async fn wait_bound_covers_session_open() {
        let store = Arc::new(StalledGrants(InMemoryStore::new()));
        let coordinator = Coordinator::new(store, SyncConfig::default().with_prefix("/t")).unwrap();

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            coordinator.lock("jobs", LockOptions::default().wait(Duration::from_millis(100))),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { wait_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn unlock_leaves_own_queued_attempt_alone() {
        let (store, coordinator) = coordinator();
        let holder = Coordinator::new(store.clone(), SyncConfig::default().with_prefix("/t")).unwrap();
        holder.lock("jobs", LockOptions::default()).await.unwrap();

        let coordinator = Arc::new(coordinator);
        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.lock("jobs", LockOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = coordinator.unlock("jobs").await.unwrap_err();
        assert!(matches!(err, SyncError::LockNotFound { .. }));
        assert_eq!(store.get_prefix("/t/locks/jobs/").await.unwrap().entries.len(), 2);

        holder.unlock("jobs").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap().unwrap();
        assert!(coordinator.is_locked("jobs"));
    }

    #[tokio::test]
    async fn empty_namespace_lists_default_members() {
        let (_store, coordinator) = coordinator();
        let leadership = coordinator.leader(LeaderOptions::default().id("").namespace("")).await.unwrap();
        let members = coordinator.list_members(ListMembersOptions::default().namespace("")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, leadership.id());
        assert_eq!(members[0].namespace, "default");
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let err = Coordinator::in_memory(SyncConfig::default().with_prefix("relative")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn lock_names_are_escaped() {
        let (store, coordinator) = coordinator();
        coordinator.lock("a/b", LockOptions::default()).await.unwrap();
        coordinator.lock("a-b", LockOptions::default()).await.unwrap();
        assert_eq!(store.get_prefix("/t/locks/a%2Fb/").await.unwrap().entries.len(), 1);
        assert_eq!(coordinator.held_locks(), vec!["a-b".to_string(), "a/b".to_string()]);
    }
}
