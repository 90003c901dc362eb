//! Value types exchanged with the coordination store.

use std::fmt;

use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;

use crate::error::KeyValueStoreError;

/// Identifier of a store-managed lease.
///
/// Displayed in lowercase hex, which is also how it appears inside keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// Wrap a raw lease id.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw lease id.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A key with its value and revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,
    /// The value. Empty for delete events.
    pub value: String,
    /// Store revision at which the key was created.
    pub create_revision: u64,
    /// Store revision of the last modification.
    pub mod_revision: u64,
    /// Number of writes since creation.
    pub version: u64,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// Result of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    /// Matching entries, sorted by key.
    pub entries: Vec<KeyValue>,
    /// Store revision at which the scan was served.
    pub revision: u64,
}

/// Outcome of [`CoordinationStore::create_if_absent`](crate::CoordinationStore::create_if_absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key did not exist and was written.
    Created(KeyValue),
    /// The key already existed; nothing was written.
    Exists(KeyValue),
}

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Lease identifier.
    pub id: LeaseId,
    /// Granted TTL in seconds.
    pub ttl_secs: u64,
}

/// Kind of change reported by the watch feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted, explicitly or by lease expiry.
    Delete,
}

/// A single change from the watch feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Type of change.
    pub event_type: WatchEventType,
    /// Key state after the change. For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
    /// Store revision of the change.
    pub revision: u64,
}

impl WatchEvent {
    /// Returns true for put events.
    pub fn is_put(&self) -> bool {
        self.event_type == WatchEventType::Put
    }

    /// Returns true for delete events.
    pub fn is_delete(&self) -> bool {
        self.event_type == WatchEventType::Delete
    }
}

/// Revision-ordered stream of changes. Dropping the stream cancels the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, KeyValueStoreError>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_id_displays_as_hex() {
        assert_eq!(LeaseId::new(0x7a3f).to_string(), "7a3f");
        assert_eq!(LeaseId::new(1).value(), 1);
    }

    #[test]
    fn lease_ids_order_numerically() {
        assert!(LeaseId::new(2) < LeaseId::new(10));
    }
}
