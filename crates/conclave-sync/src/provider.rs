//! Pluggable provider surface.
//!
//! Host applications select a backend by name at startup. A
//! [`ProviderRegistry`] owned by the application maps names to
//! [`ProviderFactory`] implementations; each factory turns a [`SyncConfig`]
//! into a ready [`SyncProvider`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conclave_kv::InMemoryStore;

use crate::config::SyncConfig;
use crate::coordinator::Coordinator;
use crate::error::SyncError;
use crate::error::UnknownProviderSnafu;
use crate::leadership::Leadership;
use crate::options::LeaderOptions;
use crate::options::ListMembersOptions;
use crate::options::LockOptions;
use crate::options::WatchElectOptions;
use crate::types::Member;
use crate::watcher::ElectWatcher;

/// Name of the in-memory provider.
pub const MEMORY_PROVIDER: &str = "memory";
/// Name of the etcd provider.
pub const ETCD_PROVIDER: &str = "etcd";

/// Coordination operations as seen by a host framework.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Backend name.
    fn name(&self) -> &str;

    /// Acquire a named lock.
    async fn lock(&self, id: &str, options: LockOptions) -> Result<(), SyncError>;

    /// Release a named lock.
    async fn unlock(&self, id: &str) -> Result<(), SyncError>;

    /// Register as an election candidate.
    async fn leader(&self, options: LeaderOptions) -> Result<Leadership, SyncError>;

    /// List a namespace's members.
    async fn list_members(&self, options: ListMembersOptions) -> Result<Vec<Member>, SyncError>;

    /// Watch a namespace's membership changes.
    async fn watch_elect(&self, options: WatchElectOptions) -> Result<ElectWatcher, SyncError>;
}

#[async_trait]
impl SyncProvider for Coordinator {
    fn name(&self) -> &str {
        self.backend()
    }

    async fn lock(&self, id: &str, options: LockOptions) -> Result<(), SyncError> {
        Coordinator::lock(self, id, options).await
    }

    async fn unlock(&self, id: &str) -> Result<(), SyncError> {
        Coordinator::unlock(self, id).await
    }

    async fn leader(&self, options: LeaderOptions) -> Result<Leadership, SyncError> {
        Coordinator::leader(self, options).await
    }

    async fn list_members(&self, options: ListMembersOptions) -> Result<Vec<Member>, SyncError> {
        Coordinator::list_members(self, options).await
    }

    async fn watch_elect(&self, options: WatchElectOptions) -> Result<ElectWatcher, SyncError> {
        Coordinator::watch_elect(self, options).await
    }
}

/// Builds providers of one kind.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Name the factory is registered under.
    fn name(&self) -> &str;

    /// Build a provider from configuration.
    async fn create(&self, config: &SyncConfig) -> Result<Arc<dyn SyncProvider>, SyncError>;
}

/// In-memory providers. Every provider built by one factory shares its store,
/// so they coordinate with each other inside the process.
#[derive(Clone, Default)]
pub struct MemoryProviderFactory {
    store: Arc<InMemoryStore>,
}

impl MemoryProviderFactory {
    /// A factory with a fresh store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared store.
    pub fn store(&self) -> Arc<InMemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl ProviderFactory for MemoryProviderFactory {
    fn name(&self) -> &str {
        MEMORY_PROVIDER
    }

    async fn create(&self, config: &SyncConfig) -> Result<Arc<dyn SyncProvider>, SyncError> {
        let coordinator = Coordinator::from_dyn(self.store.clone(), config.clone(), MEMORY_PROVIDER)?;
        Ok(Arc::new(coordinator))
    }
}

/// Providers backed by an etcd cluster.
#[cfg(feature = "etcd")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdProviderFactory;

#[cfg(feature = "etcd")]
#[async_trait]
impl ProviderFactory for EtcdProviderFactory {
    fn name(&self) -> &str {
        ETCD_PROVIDER
    }

    async fn create(&self, config: &SyncConfig) -> Result<Arc<dyn SyncProvider>, SyncError> {
        Ok(Arc::new(Coordinator::connect_etcd(config.clone()).await?))
    }
}

/// Name to factory map, owned by the application's composition root.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in factories.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MemoryProviderFactory::new()));
        #[cfg(feature = "etcd")]
        registry.register(Arc::new(EtcdProviderFactory));
        registry
    }

    /// Add a factory under its own name, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) -> Option<Arc<dyn ProviderFactory>> {
        self.factories.insert(factory.name().to_string(), factory)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a provider with the factory registered under `name`.
    pub async fn create(&self, name: &str, config: &SyncConfig) -> Result<Arc<dyn SyncProvider>, SyncError> {
        let Some(factory) = self.factories.get(name) else {
            return UnknownProviderSnafu { name }.fail();
        };
        factory.create(config).await
    }
}
