//! etcd v3 backend for [`CoordinationStore`].
//!
//! Every trait operation maps onto one etcd RPC: create-if-absent and the
//! create-revision guarded update are single `Txn`s, leases use the lease
//! service, and prefix watches use the watch service with `start_revision`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::LeaseKeepAliveStream;
use etcd_client::LeaseKeeper;
use etcd_client::PutOptions;
use etcd_client::SortOrder;
use etcd_client::SortTarget;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::TxnOpResponse;
use etcd_client::WatchOptions;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::KeyValueStoreError;
use crate::traits::CoordinationStore;
use crate::types::CreateOutcome;
use crate::types::KeyValue;
use crate::types::LeaseGrant;
use crate::types::LeaseId;
use crate::types::RangeResult;
use crate::types::WatchEvent;
use crate::types::WatchEventType;
use crate::types::WatchStream;

/// Username/password credentials for an etcd cluster with auth enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdCredentials {
    /// etcd user.
    pub username: String,
    /// Password for `username`.
    pub password: String,
}

/// [`CoordinationStore`] backed by an etcd v3 cluster.
///
/// The underlying client multiplexes over one gRPC channel and is cheap to
/// clone, so each call works on its own clone. Each lease keeps one
/// keep-alive stream open until it is revoked or reported gone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    keepers: Arc<Mutex<HashMap<LeaseId, Arc<tokio::sync::Mutex<Keeper>>>>>,
}

struct Keeper {
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
}

impl EtcdStore {
    /// Connect to the given endpoints.
    pub async fn connect(endpoints: &[String], credentials: Option<EtcdCredentials>) -> Result<Self, KeyValueStoreError> {
        let options = credentials.map(|c| ConnectOptions::new().with_user(c.username, c.password));
        let client = Client::connect(endpoints, options).await.map_err(unavailable)?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            keepers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The keep-alive stream for `lease`, opened on first use.
    async fn keeper(&self, lease: LeaseId) -> Result<Arc<tokio::sync::Mutex<Keeper>>, KeyValueStoreError> {
        let existing = self.keepers.lock().get(&lease).cloned();
        if let Some(keeper) = existing {
            return Ok(keeper);
        }
        let mut client = self.client.clone();
        let (keeper, responses) = client.lease_keep_alive(lease.value()).await.map_err(|e| lease_error(lease, e))?;
        let opened = Arc::new(tokio::sync::Mutex::new(Keeper { keeper, responses }));
        // A concurrent caller may have opened one first; keep theirs.
        Ok(self.keepers.lock().entry(lease).or_insert(opened).clone())
    }

    fn forget_keeper(&self, lease: LeaseId) {
        self.keepers.lock().remove(&lease);
    }
}

fn unavailable(err: etcd_client::Error) -> KeyValueStoreError {
    KeyValueStoreError::Unavailable {
        reason: err.to_string(),
    }
}

fn lease_error(lease_id: LeaseId, err: etcd_client::Error) -> KeyValueStoreError {
    if err.to_string().contains("lease not found") {
        KeyValueStoreError::LeaseNotFound { lease_id }
    } else {
        unavailable(err)
    }
}

fn put_options(lease: Option<LeaseId>) -> Option<PutOptions> {
    lease.map(|id| PutOptions::new().with_lease(id.value()))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue, KeyValueStoreError> {
    let key = kv.key_str().map_err(unavailable)?.to_string();
    let value = kv.value_str().map_err(unavailable)?.to_string();
    let lease = match kv.lease() {
        0 => None,
        id => Some(LeaseId::new(id)),
    };
    Ok(KeyValue {
        key,
        value,
        create_revision: kv.create_revision() as u64,
        mod_revision: kv.mod_revision() as u64,
        version: kv.version() as u64,
        lease,
    })
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> u64 {
    header.map(|h| h.revision() as u64).unwrap_or(0)
}

/// Queue one watch response's events in order.
///
/// Stops at the first conversion error, queued after the events before it.
/// Returns false if the batch ended in an error.
fn enqueue_batch<I>(pending: &mut VecDeque<Result<WatchEvent, KeyValueStoreError>>, batch: I) -> bool
where
    I: IntoIterator<Item = Result<WatchEvent, KeyValueStoreError>>,
{
    for event in batch {
        let failed = event.is_err();
        pending.push_back(event);
        if failed {
            return false;
        }
    }
    true
}

struct WatchState {
    // Dropping the watcher handle would cancel the server-side watch.
    _watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
    pending: VecDeque<Result<WatchEvent, KeyValueStoreError>>,
    done: bool,
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64, KeyValueStoreError> {
        let mut client = self.client.clone();
        let response = client.put(key, value, put_options(lease)).await.map_err(unavailable)?;
        Ok(header_revision(response.header()))
    }

    async fn put_if_created_at(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        create_revision: u64,
    ) -> Result<bool, KeyValueStoreError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, create_revision as i64)])
            .and_then(vec![TxnOp::put(key, value, put_options(lease))]);
        let response = client.txn(txn).await.map_err(unavailable)?;
        Ok(response.succeeded())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<CreateOutcome, KeyValueStoreError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_options(lease))])
            .or_else(vec![TxnOp::get(key, None)]);
        let response = client.txn(txn).await.map_err(unavailable)?;

        if response.succeeded() {
            let revision = header_revision(response.header());
            return Ok(CreateOutcome::Created(KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease,
            }));
        }

        for op in response.op_responses() {
            if let TxnOpResponse::Get(get) = op
                && let Some(kv) = get.kvs().first()
            {
                return Ok(CreateOutcome::Exists(convert_kv(kv)?));
            }
        }
        // The key vanished between the compare and the get.
        Err(KeyValueStoreError::Failed {
            reason: format!("create of '{key}' raced with a concurrent delete"),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await.map_err(unavailable)?;
        response.kvs().first().map(convert_kv).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResult, KeyValueStoreError> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_sort(SortTarget::Key, SortOrder::Ascend);
        let response = client.get(prefix, Some(options)).await.map_err(unavailable)?;
        let entries = response.kvs().iter().map(convert_kv).collect::<Result<Vec<_>, _>>()?;
        Ok(RangeResult {
            entries,
            revision: header_revision(response.header()),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, KeyValueStoreError> {
        let mut client = self.client.clone();
        let response = client.delete(key, None).await.map_err(unavailable)?;
        Ok(response.deleted() > 0)
    }

    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseGrant, KeyValueStoreError> {
        let mut client = self.client.clone();
        let response = client.lease_grant(ttl_secs as i64, None).await.map_err(unavailable)?;
        Ok(LeaseGrant {
            id: LeaseId::new(response.id()),
            ttl_secs: response.ttl().max(0) as u64,
        })
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<u64, KeyValueStoreError> {
        let keeper = self.keeper(lease).await?;
        let renewed = {
            let mut keeper = keeper.lock().await;
            match keeper.keeper.keep_alive().await {
                Ok(()) => keeper.responses.message().await,
                Err(err) => Err(err),
            }
        };
        match renewed {
            Ok(Some(response)) if response.ttl() > 0 => Ok(response.ttl() as u64),
            Ok(_) => {
                self.forget_keeper(lease);
                Err(KeyValueStoreError::LeaseNotFound { lease_id: lease })
            }
            Err(err) => {
                // The stream is unusable after an error; reopen on the next renewal.
                self.forget_keeper(lease);
                Err(lease_error(lease, err))
            }
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
        self.forget_keeper(lease);
        let mut client = self.client.clone();
        client.lease_revoke(lease.value()).await.map_err(|e| lease_error(lease, e))?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, KeyValueStoreError> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision as i64);
        }
        let (watcher, stream) = client.watch(prefix, Some(options)).await.map_err(unavailable)?;

        let state = WatchState {
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
            done: false,
        };

        let events = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }
                match state.stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            state.done = true;
                            let err = if response.compact_revision() > 0 {
                                KeyValueStoreError::Compacted {
                                    requested: start_revision.unwrap_or(0),
                                    compacted: response.compact_revision() as u64,
                                }
                            } else {
                                KeyValueStoreError::Failed {
                                    reason: "watch canceled by server".to_string(),
                                }
                            };
                            return Some((Err(err), state));
                        }
                        let batch = response.events().iter().filter_map(|event| {
                            let event_type = match event.event_type() {
                                EventType::Put => WatchEventType::Put,
                                EventType::Delete => WatchEventType::Delete,
                            };
                            event.kv().map(|kv| {
                                convert_kv(kv).map(|kv| WatchEvent {
                                    event_type,
                                    revision: kv.mod_revision,
                                    kv,
                                })
                            })
                        });
                        if !enqueue_batch(&mut state.pending, batch) {
                            state.done = true;
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        state.done = true;
                        return Some((Err(unavailable(err)), state));
                    }
                }
            }
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, revision: u64) -> Result<WatchEvent, KeyValueStoreError> {
        Ok(WatchEvent {
            event_type: WatchEventType::Put,
            revision,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease: None,
            },
        })
    }

    #[test]
    fn batch_error_follows_earlier_events() {
        let mut pending = VecDeque::new();
        let batch = vec![
            event("/a", 4),
            event("/b", 5),
            Err(KeyValueStoreError::Failed {
                reason: "bad utf-8".to_string(),
            }),
            event("/c", 6),
        ];
        assert!(!enqueue_batch(&mut pending, batch));

        let keys: Vec<_> = pending.iter().map(|e| e.as_ref().ok().map(|e| e.kv.key.clone())).collect();
        assert_eq!(keys, vec![Some("/a".to_string()), Some("/b".to_string()), None]);
    }

    #[test]
    fn clean_batch_is_queued_whole() {
        let mut pending = VecDeque::new();
        assert!(enqueue_batch(&mut pending, vec![event("/a", 4), event("/b", 5)]));
        assert_eq!(pending.len(), 2);
    }
}
