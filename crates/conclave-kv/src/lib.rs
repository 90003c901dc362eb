//! Coordination store interface for conclave.
//!
//! The coordination layer needs a strongly-consistent key-value store with
//! leases and an ordered change feed. This crate defines that capability as the
//! [`CoordinationStore`] trait and ships two backends:
//!
//! - [`InMemoryStore`] - deterministic single-process store for tests and local use
//! - `EtcdStore` - etcd v3 cluster (feature `etcd`)
//!
//! # Feature Flags
//!
//! - `etcd`: Include the etcd backend

pub mod constants;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod inmemory;
pub mod traits;
pub mod types;

pub use error::KeyValueStoreError;
#[cfg(feature = "etcd")]
pub use etcd::EtcdCredentials;
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use inmemory::InMemoryStore;
pub use traits::CoordinationStore;
pub use types::CreateOutcome;
pub use types::KeyValue;
pub use types::LeaseGrant;
pub use types::LeaseId;
pub use types::RangeResult;
pub use types::WatchEvent;
pub use types::WatchEventType;
pub use types::WatchStream;
