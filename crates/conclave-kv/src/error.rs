//! Error types for coordination store operations.

use snafu::Snafu;

use crate::types::LeaseId;

/// Errors returned by a [`CoordinationStore`](crate::CoordinationStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// Transport or RPC failure talking to the store.
    #[snafu(display("coordination store unavailable: {reason}"))]
    Unavailable {
        /// What went wrong.
        reason: String,
    },

    /// The lease does not exist (never granted, revoked, or expired).
    #[snafu(display("lease {lease_id} not found"))]
    LeaseNotFound {
        /// The missing lease.
        lease_id: LeaseId,
    },

    /// Keys must not be empty.
    #[snafu(display("key cannot be empty"))]
    EmptyKey,

    /// The requested watch start revision is no longer retained.
    #[snafu(display("revision {requested} has been compacted (compacted through {compacted})"))]
    Compacted {
        /// Revision the watch asked to start from.
        requested: u64,
        /// Highest revision no longer available.
        compacted: u64,
    },

    /// A watcher fell behind the change feed and missed events.
    #[snafu(display("watch lagged behind the change feed, {skipped} events skipped"))]
    WatchLagged {
        /// Number of events that were dropped.
        skipped: u64,
    },

    /// Any other backend failure.
    #[snafu(display("operation failed: {reason}"))]
    Failed {
        /// What went wrong.
        reason: String,
    },
}
