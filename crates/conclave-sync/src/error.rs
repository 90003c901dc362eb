//! Error types for the coordination layer.

use std::path::PathBuf;

use conclave_kv::KeyValueStoreError;
use conclave_kv::LeaseId;
use snafu::Snafu;

/// Errors from locks, elections, membership listing and watchers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    /// The wait bound elapsed while contending for a lock.
    #[snafu(display("timed out after {wait_ms}ms waiting for lock '{id}'"))]
    LockTimeout {
        /// Lock name.
        id: String,
        /// Configured wait bound.
        wait_ms: u64,
    },

    /// `unlock` was called for a lock this coordinator does not hold.
    #[snafu(display("lock '{id}' is not held by this coordinator"))]
    LockNotFound {
        /// Lock name.
        id: String,
    },

    /// The coordination store failed the request.
    #[snafu(display("coordination store error: {source}"))]
    StoreUnavailable {
        /// The underlying store error.
        source: KeyValueStoreError,
    },

    /// A stored record could not be parsed.
    #[snafu(display("failed to decode record at '{key}': {source}"))]
    Decode {
        /// Key holding the record.
        key: String,
        /// The underlying error.
        source: serde_json::Error,
    },

    /// A record could not be serialized.
    #[snafu(display("failed to encode record: {source}"))]
    Encode {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// The leadership handle was resigned or its session expired.
    #[snafu(display("candidate '{id}' is no longer campaigning in namespace '{namespace}'"))]
    NotLeading {
        /// Election namespace.
        namespace: String,
        /// Candidate id.
        id: String,
    },

    /// The candidacy ended before it was elected.
    #[snafu(display("candidate '{id}' lost its candidacy in namespace '{namespace}'"))]
    ElectionLost {
        /// Election namespace.
        namespace: String,
        /// Candidate id.
        id: String,
    },

    /// Nobody currently holds the election.
    #[snafu(display("no leader elected in namespace '{namespace}'"))]
    NoLeader {
        /// Election namespace.
        namespace: String,
    },

    /// Another live candidacy already uses this id.
    #[snafu(display("candidate '{id}' is already registered in namespace '{namespace}'"))]
    CandidateExists {
        /// Election namespace.
        namespace: String,
        /// Candidate id.
        id: String,
    },

    /// The session's lease is gone, so every key tied to it is gone too.
    #[snafu(display("session lease {lease_id} expired"))]
    SessionExpired {
        /// The lost lease.
        lease_id: LeaseId,
    },

    /// The watcher was closed or its change feed terminated.
    #[snafu(display("watcher is closed"))]
    WatcherClosed,

    /// No provider factory is registered under this name.
    #[snafu(display("no sync provider registered under '{name}'"))]
    UnknownProvider {
        /// Requested provider name.
        name: String,
    },

    /// Configuration failed validation.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// The configuration file could not be read.
    #[snafu(display("failed to read config file '{}': {source}", path.display()))]
    ConfigRead {
        /// File that was read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`SyncConfig`](crate::SyncConfig).
    #[snafu(display("failed to parse config: {source}"))]
    ConfigParse {
        /// The underlying error.
        source: toml::de::Error,
    },
}

impl SyncError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::LockTimeout { .. } | SyncError::StoreUnavailable { .. })
    }
}

impl From<KeyValueStoreError> for SyncError {
    fn from(source: KeyValueStoreError) -> Self {
        SyncError::StoreUnavailable { source }
    }
}
