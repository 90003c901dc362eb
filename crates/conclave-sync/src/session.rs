//! Lease-backed sessions.
//!
//! A session owns one store lease and keeps it alive from a background task.
//! Every key written by a lock holder or election candidate is attached to its
//! session lease, so a crashed process loses its locks and candidacies once the
//! lease runs out.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use conclave_kv::CoordinationStore;
use conclave_kv::KeyValueStoreError;
use conclave_kv::LeaseId;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::MIN_KEEP_ALIVE_INTERVAL_MS;
use crate::error::SyncError;

pub(crate) struct Session {
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    ttl_secs: u64,
    done: CancellationToken,
    closed: AtomicBool,
    expired: Arc<AtomicBool>,
}

/// Delay before the next keep-alive: a third of the TTL, minus up to 10% jitter.
fn keep_alive_interval(ttl_secs: u64) -> Duration {
    let base_ms = (ttl_secs.saturating_mul(1000) / 3).max(MIN_KEEP_ALIVE_INTERVAL_MS);
    let jitter_ms = rand::rng().random_range(0..=base_ms / 10);
    Duration::from_millis((base_ms - jitter_ms).max(MIN_KEEP_ALIVE_INTERVAL_MS))
}

impl Session {
    /// Grant a lease and start renewing it.
    pub(crate) async fn open(store: Arc<dyn CoordinationStore>, ttl_secs: u64) -> Result<Self, SyncError> {
        let grant = store.lease_grant(ttl_secs).await?;
        let done = CancellationToken::new();
        let expired = Arc::new(AtomicBool::new(false));

        tokio::spawn(keep_alive_loop(store.clone(), grant.id, grant.ttl_secs, done.clone(), expired.clone()));
        debug!(lease = %grant.id, ttl_secs = grant.ttl_secs, "session opened");

        Ok(Self {
            store,
            lease: grant.id,
            ttl_secs: grant.ttl_secs,
            done,
            closed: AtomicBool::new(false),
            expired,
        })
    }

    pub(crate) fn lease(&self) -> LeaseId {
        self.lease
    }

    pub(crate) fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Whether the store reported the lease as gone.
    pub(crate) fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Cancelled once the session is closed or its lease expires.
    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Stop renewing and revoke the lease. Safe to call more than once.
    pub(crate) async fn close(&self) -> Result<(), SyncError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.done.cancel();
        match self.store.lease_revoke(self.lease).await {
            Ok(()) | Err(KeyValueStoreError::LeaseNotFound { .. }) => {
                info!(lease = %self.lease, "session closed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        // Best effort; an unrevoked lease still expires after its TTL.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let lease = self.lease;
            handle.spawn(async move {
                if let Err(err) = store.lease_revoke(lease).await
                    && !matches!(err, KeyValueStoreError::LeaseNotFound { .. })
                {
                    warn!(lease = %lease, error = %err, "failed to revoke dropped session lease");
                }
            });
        }
    }
}

async fn keep_alive_loop(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    ttl_secs: u64,
    done: CancellationToken,
    expired: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(keep_alive_interval(ttl_secs)) => {}
        }

        match store.lease_keep_alive(lease).await {
            Ok(ttl) => debug!(lease = %lease, ttl_secs = ttl, "session lease renewed"),
            Err(KeyValueStoreError::LeaseNotFound { .. }) => {
                if !done.is_cancelled() {
                    warn!(lease = %lease, "session lease expired");
                    expired.store(true, Ordering::SeqCst);
                    done.cancel();
                }
                return;
            }
            Err(err) => warn!(lease = %lease, error = %err, "session keep-alive failed"),
        }
    }
}
