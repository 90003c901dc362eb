//! The coordination store interface.

use async_trait::async_trait;

use crate::error::KeyValueStoreError;
use crate::types::CreateOutcome;
use crate::types::KeyValue;
use crate::types::LeaseGrant;
use crate::types::LeaseId;
use crate::types::RangeResult;
use crate::types::WatchStream;

/// Strongly-consistent key-value store with leases and a change feed.
///
/// Every write is linearizable and bumps a single store-wide revision.
/// Keys attached to a lease are deleted when the lease is revoked or expires,
/// and those deletions appear on the watch feed like any other delete.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` under `key`, optionally attached to `lease`. Returns the write revision.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64, KeyValueStoreError>;

    /// Overwrite `key` only if it still exists with the given create revision.
    ///
    /// Returns false without writing when the key is gone or was recreated.
    async fn put_if_created_at(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        create_revision: u64,
    ) -> Result<bool, KeyValueStoreError>;

    /// Create `key` only if it does not exist (compare create revision == 0).
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<CreateOutcome, KeyValueStoreError>;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError>;

    /// Read every key starting with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResult, KeyValueStoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KeyValueStoreError>;

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseGrant, KeyValueStoreError>;

    /// Refresh a lease once. Returns the TTL it was renewed for.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<u64, KeyValueStoreError>;

    /// Revoke a lease, deleting all keys attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KeyValueStoreError>;

    /// Watch every key starting with `prefix`.
    ///
    /// With `start_revision` the feed replays changes from that revision on;
    /// without it only changes after the call are delivered.
    async fn watch_prefix(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, KeyValueStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for std::sync::Arc<T> {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64, KeyValueStoreError> {
        (**self).put(key, value, lease).await
    }

    async fn put_if_created_at(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        create_revision: u64,
    ) -> Result<bool, KeyValueStoreError> {
        (**self).put_if_created_at(key, value, lease, create_revision).await
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<CreateOutcome, KeyValueStoreError> {
        (**self).create_if_absent(key, value, lease).await
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError> {
        (**self).get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResult, KeyValueStoreError> {
        (**self).get_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KeyValueStoreError> {
        (**self).delete(key).await
    }

    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseGrant, KeyValueStoreError> {
        (**self).lease_grant(ttl_secs).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<u64, KeyValueStoreError> {
        (**self).lease_keep_alive(lease).await
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
        (**self).lease_revoke(lease).await
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, KeyValueStoreError> {
        (**self).watch_prefix(prefix, start_revision).await
    }
}
