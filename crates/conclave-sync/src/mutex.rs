//! Store-backed mutual exclusion for a single session.

use std::sync::Arc;

use conclave_kv::CoordinationStore;
use conclave_kv::CreateOutcome;
use conclave_kv::LeaseId;
use tracing::debug;
use tracing::warn;

use crate::contention::wait_for_turn;
use crate::error::SessionExpiredSnafu;
use crate::error::SyncError;
use crate::keys::lock_holder_key;
use crate::types::LockRecord;

/// One session's claim on a lock.
///
/// The holder key is `<lock prefix><lease hex>`; queue position is its create
/// revision.
pub(crate) struct StoreMutex {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    key: String,
    lease: LeaseId,
}

impl StoreMutex {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, lock_prefix: String, lease: LeaseId) -> Self {
        let key = lock_holder_key(&lock_prefix, lease);
        Self {
            store,
            prefix: lock_prefix,
            key,
            lease,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Queue behind current holders and wait until granted.
    ///
    /// On any failure the holder key is removed again so no other waiter
    /// stays queued behind it.
    pub(crate) async fn lock(&self, record: &LockRecord) -> Result<(), SyncError> {
        let value = record.encode()?;
        let create_revision = match self.store.create_if_absent(&self.key, &value, Some(self.lease)).await? {
            CreateOutcome::Created(kv) => kv.create_revision,
            // Left over from an earlier attempt on this session.
            CreateOutcome::Exists(kv) => kv.create_revision,
        };

        match wait_for_turn(self.store.as_ref(), &self.prefix, &self.key, create_revision).await {
            Ok(true) => {
                debug!(key = %self.key, "lock granted");
                Ok(())
            }
            Ok(false) => SessionExpiredSnafu { lease_id: self.lease }.fail(),
            Err(err) => {
                if let Err(cleanup) = self.store.delete(&self.key).await {
                    warn!(key = %self.key, error = %cleanup, "failed to withdraw lock claim");
                }
                Err(err)
            }
        }
    }

    /// Release the lock by deleting the holder key.
    pub(crate) async fn unlock(&self) -> Result<(), SyncError> {
        self.store.delete(&self.key).await?;
        debug!(key = %self.key, "lock released");
        Ok(())
    }
}
