//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use conclave::Coordinator;
use conclave::InMemoryStore;
use conclave::SyncConfig;

/// Upper bound on any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Key-space root used by every test coordinator.
pub const TEST_PREFIX: &str = "/conclave-test";

/// Install a fmt subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conclave_sync=debug,conclave_kv=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init().ok();
}

/// A coordinator over `store` with its own holder id.
pub fn coordinator(store: &Arc<InMemoryStore>) -> Coordinator {
    Coordinator::new(store.clone(), SyncConfig::default().with_prefix(TEST_PREFIX)).expect("valid test config")
}

/// A coordinator over `store` with a fixed holder id.
pub fn coordinator_with_holder(store: &Arc<InMemoryStore>, holder_id: &str) -> Coordinator {
    let config = SyncConfig::default().with_prefix(TEST_PREFIX).with_holder_id(holder_id);
    Coordinator::new(store.clone(), config).expect("valid test config")
}

/// `n` coordinators sharing one fresh store, as if they were separate processes.
pub fn cluster(n: usize) -> (Arc<InMemoryStore>, Vec<Coordinator>) {
    let store = InMemoryStore::new();
    let nodes = (0..n).map(|_| coordinator(&store)).collect();
    (store, nodes)
}
