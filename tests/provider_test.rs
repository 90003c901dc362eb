//! Provider registry and configuration as a host application uses them.

mod common;

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use conclave::CoordinationStore;
use conclave::LeaderOptions;
use conclave::ListMembersOptions;
use conclave::LockOptions;
use conclave::ProviderRegistry;
use conclave::SyncConfig;
use conclave::SyncError;
use conclave::sync::MEMORY_PROVIDER;

#[tokio::test]
async fn test_registry_builds_working_providers() -> Result<()> {
    common::init_tracing();
    let registry = ProviderRegistry::with_builtin();
    let config = SyncConfig::default().with_prefix("/host/app");

    let provider = registry.create(MEMORY_PROVIDER, &config).await?;
    assert_eq!(provider.name(), MEMORY_PROVIDER);

    provider.lock("boot", LockOptions::default().wait(Duration::from_secs(1))).await?;
    provider.unlock("boot").await?;

    let leadership = provider.leader(LeaderOptions::default().id("host-1")).await?;
    leadership.wait_elected().await?;
    let members = provider.list_members(ListMembersOptions::default()).await?;
    assert_eq!(members.len(), 1);
    assert!(members[0].is_primary());
    leadership.resign().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_provider() -> Result<()> {
    let registry = ProviderRegistry::with_builtin();
    let err = registry.create("consul", &SyncConfig::default()).await.err().expect("unknown provider accepted");
    assert!(matches!(err, SyncError::UnknownProvider { .. }));
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_config_file_drives_coordinator() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "prefix = \"/from/file/\"\nholder_id = \"file-holder\"")?;
    let config = SyncConfig::load(file.path())?;

    let coordinator = conclave::Coordinator::in_memory(config)?;
    assert_eq!(coordinator.config().key_prefix(), "/from/file");
    assert_eq!(coordinator.config().holder_id, "file-holder");
    assert_eq!(coordinator.backend(), "memory");

    coordinator.lock("jobs", LockOptions::default()).await?;
    let store = coordinator.store();
    let range = store.get_prefix("/from/file/locks/jobs/").await?;
    assert_eq!(range.entries.len(), 1);
    assert!(range.entries[0].value.contains("file-holder"));
    Ok(())
}
