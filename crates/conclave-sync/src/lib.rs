//! Distributed locks, leader election and membership over a coordination store.
//!
//! - [`Coordinator::lock`] / [`Coordinator::unlock`] - named locks with a
//!   session TTL and an optional wait bound
//! - [`Coordinator::leader`] - register as an election candidate; the returned
//!   [`Leadership`] reports status, observes leader changes and resigns
//! - [`Coordinator::list_members`] - a namespace's members with their roles
//! - [`Coordinator::watch_elect`] - a stream of membership changes
//!
//! Every key written by this crate is attached to a lease that a background
//! task renews, so a process that dies loses its locks and candidacies once
//! the lease runs out.
//!
//! ## Example
//!
//! ```ignore
//! use conclave_sync::{Coordinator, LeaderOptions, LockOptions, SyncConfig};
//!
//! let coordinator = Coordinator::in_memory(SyncConfig::default())?;
//!
//! coordinator.lock("nightly-report", LockOptions::default().wait(Duration::from_secs(3))).await?;
//! // ... critical section ...
//! coordinator.unlock("nightly-report").await?;
//!
//! let leadership = coordinator.leader(LeaderOptions::default().namespace("scheduler")).await?;
//! leadership.status().await.ok();
//! // ... leader-only work ...
//! leadership.resign().await?;
//! ```
//!
//! # Feature Flags
//!
//! - `etcd`: `Coordinator::connect_etcd` and the `etcd` provider factory

mod config;
pub mod constants;
mod contention;
mod coordinator;
mod election;
mod error;
pub mod keys;
mod leadership;
mod members;
mod mutex;
mod options;
mod provider;
mod session;
mod types;
mod watcher;

pub use config::ENV_HOLDER_ID;
pub use config::ENV_NODES;
pub use config::ENV_PREFIX;
pub use config::StoreAuth;
pub use config::SyncConfig;
pub use coordinator::Coordinator;
pub use error::SyncError;
pub use leadership::Leadership;
pub use options::LeaderOptions;
pub use options::ListMembersOptions;
pub use options::LockOptions;
pub use options::WatchElectOptions;
#[cfg(feature = "etcd")]
pub use provider::EtcdProviderFactory;
pub use provider::ETCD_PROVIDER;
pub use provider::MEMORY_PROVIDER;
pub use provider::MemoryProviderFactory;
pub use provider::ProviderFactory;
pub use provider::ProviderRegistry;
pub use provider::SyncProvider;
pub use types::CandidacyState;
pub use types::ElectEvent;
pub use types::Member;
pub use types::ObserveResult;
pub use types::Role;
pub use watcher::ElectWatcher;
