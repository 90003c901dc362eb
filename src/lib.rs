//! Conclave: distributed locks, leader election and membership.
//!
//! This crate bundles the two workspace crates:
//!
//! - [`kv`] (`conclave-kv`) - the coordination store interface and its backends
//! - [`sync`] (`conclave-sync`) - locks, elections, membership and watchers on top of it
//!
//! The most used items are re-exported at the crate root.
//!
//! # Feature Flags
//!
//! - `etcd`: etcd v3 backend and provider

pub use conclave_kv as kv;
pub use conclave_sync as sync;

pub use conclave_kv::CoordinationStore;
pub use conclave_kv::InMemoryStore;
pub use conclave_kv::KeyValueStoreError;
#[cfg(feature = "etcd")]
pub use conclave_kv::EtcdStore;
pub use conclave_sync::CandidacyState;
pub use conclave_sync::Coordinator;
pub use conclave_sync::ElectEvent;
pub use conclave_sync::ElectWatcher;
pub use conclave_sync::LeaderOptions;
pub use conclave_sync::Leadership;
pub use conclave_sync::ListMembersOptions;
pub use conclave_sync::LockOptions;
pub use conclave_sync::Member;
pub use conclave_sync::ObserveResult;
pub use conclave_sync::ProviderRegistry;
pub use conclave_sync::Role;
pub use conclave_sync::SyncConfig;
pub use conclave_sync::SyncError;
pub use conclave_sync::SyncProvider;
pub use conclave_sync::WatchElectOptions;
