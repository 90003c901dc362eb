//! Per-call options.

use std::time::Duration;

use crate::constants::DEFAULT_NAMESPACE;
use crate::constants::DEFAULT_TTL_SECS;

/// An empty namespace means the default one.
fn namespace_or_default(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace.to_string()
    }
}

/// A zero TTL means the default one.
fn ttl_or_default(ttl_secs: u64) -> u64 {
    if ttl_secs == 0 { DEFAULT_TTL_SECS } else { ttl_secs }
}

/// Options for [`Coordinator::lock`](crate::Coordinator::lock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Lifetime of the holder's session lease, in seconds. Zero means the default.
    pub ttl_secs: u64,
    /// Upper bound on the time spent waiting. `None` waits indefinitely.
    pub wait: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            wait: None,
        }
    }
}

impl LockOptions {
    /// Set the session lease lifetime.
    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Bound the wait. A zero duration means wait indefinitely.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = (!wait.is_zero()).then_some(wait);
        self
    }

    pub(crate) fn resolved_ttl_secs(&self) -> u64 {
        ttl_or_default(self.ttl_secs)
    }
}

/// Options for [`Coordinator::leader`](crate::Coordinator::leader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderOptions {
    /// Candidate id. A random UUID is used when unset or empty.
    pub id: Option<String>,
    /// Election namespace. Empty means the default namespace.
    pub namespace: String,
    /// Lifetime of the candidate's session lease, in seconds. Zero means the default.
    pub ttl_secs: u64,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            id: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl LeaderOptions {
    /// Set the candidate id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the election namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the session lease lifetime.
    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub(crate) fn resolved_id(&self) -> String {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn resolved_namespace(&self) -> String {
        namespace_or_default(&self.namespace)
    }

    pub(crate) fn resolved_ttl_secs(&self) -> u64 {
        ttl_or_default(self.ttl_secs)
    }
}

/// Options for [`Coordinator::list_members`](crate::Coordinator::list_members).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMembersOptions {
    /// Namespace to list. Empty means the default namespace.
    pub namespace: String,
}

impl Default for ListMembersOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl ListMembersOptions {
    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub(crate) fn resolved_namespace(&self) -> String {
        namespace_or_default(&self.namespace)
    }
}

/// Options for [`Coordinator::watch_elect`](crate::Coordinator::watch_elect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchElectOptions {
    /// Namespace to watch. Empty means the default namespace.
    pub namespace: String,
}

impl Default for WatchElectOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl WatchElectOptions {
    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub(crate) fn resolved_namespace(&self) -> String {
        namespace_or_default(&self.namespace)
    }
}
