//! Queueing on create revisions.
//!
//! Contenders for a lock or an election each create one key under a shared
//! prefix. The key with the lowest create revision wins; every other contender
//! watches only the key created immediately before its own, so a release wakes
//! exactly one waiter.

use conclave_kv::CoordinationStore;
use conclave_kv::KeyValue;
use futures::StreamExt;
use tracing::debug;

use crate::error::SyncError;
use crate::error::WatcherClosedSnafu;

/// The contender created most recently before `own_create_revision`.
pub(crate) fn predecessor(entries: &[KeyValue], own_create_revision: u64) -> Option<&KeyValue> {
    entries
        .iter()
        .filter(|kv| kv.create_revision < own_create_revision)
        .max_by_key(|kv| kv.create_revision)
}

/// The contender with the lowest create revision.
pub(crate) fn front(entries: &[KeyValue]) -> Option<&KeyValue> {
    entries.iter().min_by_key(|kv| kv.create_revision)
}

/// Block until `own_key` is first in line under `prefix`.
///
/// Returns `Ok(true)` once every earlier contender is gone and `Ok(false)` if
/// `own_key` itself disappeared, which happens when its lease expired or
/// someone deleted it.
pub(crate) async fn wait_for_turn<S>(
    store: &S,
    prefix: &str,
    own_key: &str,
    own_create_revision: u64,
) -> Result<bool, SyncError>
where
    S: CoordinationStore + ?Sized,
{
    loop {
        let range = store.get_prefix(prefix).await?;
        if !range.entries.iter().any(|kv| kv.key == own_key && kv.create_revision == own_create_revision) {
            return Ok(false);
        }
        let Some(waiting_on) = predecessor(&range.entries, own_create_revision) else {
            return Ok(true);
        };
        let waiting_on = waiting_on.key.clone();
        debug!(key = %own_key, waiting_on = %waiting_on, "waiting for predecessor");

        let mut events = store.watch_prefix(prefix, Some(range.revision + 1)).await?;
        loop {
            let Some(event) = events.next().await else {
                return WatcherClosedSnafu.fail();
            };
            let event = event?;
            if !event.is_delete() {
                continue;
            }
            if event.kv.key == own_key {
                return Ok(false);
            }
            if event.kv.key == waiting_on {
                // Someone earlier may still be ahead of us; rescan.
                break;
            }
        }
    }
}

/// Block until `key` no longer exists with `create_revision`.
pub(crate) async fn wait_for_removal<S>(store: &S, key: &str, create_revision: u64) -> Result<(), SyncError>
where
    S: CoordinationStore + ?Sized,
{
    // Prefix reads carry the revision to resume the watch from.
    let range = store.get_prefix(key).await?;
    if !range.entries.iter().any(|kv| kv.key == key && kv.create_revision == create_revision) {
        return Ok(());
    }
    let mut events = store.watch_prefix(key, Some(range.revision + 1)).await?;
    while let Some(event) = events.next().await {
        let event = event?;
        if event.kv.key == key && (event.is_delete() || event.kv.create_revision != create_revision) {
            return Ok(());
        }
    }
    WatcherClosedSnafu.fail()
}
