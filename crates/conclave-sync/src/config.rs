//! Coordinator configuration.
//!
//! Loaded from TOML with serde defaults, then optionally overridden from the
//! environment:
//!
//! | Variable                  | Field       |
//! |---------------------------|-------------|
//! | `CONCLAVE_SYNC_NODES`     | `nodes` (comma-separated) |
//! | `CONCLAVE_SYNC_PREFIX`    | `prefix`    |
//! | `CONCLAVE_SYNC_HOLDER_ID` | `holder_id` |

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::constants::DEFAULT_ENDPOINT;
use crate::constants::DEFAULT_PREFIX;
use crate::error::ConfigParseSnafu;
use crate::error::ConfigReadSnafu;
use crate::error::InvalidConfigSnafu;
use crate::error::SyncError;
use crate::keys::normalize_prefix;

/// Environment variable overriding [`SyncConfig::nodes`].
pub const ENV_NODES: &str = "CONCLAVE_SYNC_NODES";
/// Environment variable overriding [`SyncConfig::prefix`].
pub const ENV_PREFIX: &str = "CONCLAVE_SYNC_PREFIX";
/// Environment variable overriding [`SyncConfig::holder_id`].
pub const ENV_HOLDER_ID: &str = "CONCLAVE_SYNC_HOLDER_ID";

mod defaults {
    use super::DEFAULT_ENDPOINT;
    use super::DEFAULT_PREFIX;

    pub fn nodes() -> Vec<String> { vec![DEFAULT_ENDPOINT.to_string()] }
    pub fn prefix() -> String { DEFAULT_PREFIX.to_string() }
    pub fn holder_id() -> String { uuid::Uuid::new_v4().to_string() }
}

/// Credentials for stores with authentication enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAuth {
    /// User name.
    pub username: String,
    /// Password for `username`.
    pub password: String,
}

/// Settings shared by every operation of one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Store endpoints, in preference order.
    #[serde(default = "defaults::nodes")]
    pub nodes: Vec<String>,
    /// Root of the coordination key space.
    #[serde(default = "defaults::prefix")]
    pub prefix: String,
    /// Identity written into lock holder records, used to find this
    /// coordinator's locks again if the local table lost track of them.
    #[serde(default = "defaults::holder_id")]
    pub holder_id: String,
    /// Store credentials.
    #[serde(default)]
    pub auth: Option<StoreAuth>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            nodes: defaults::nodes(),
            prefix: defaults::prefix(),
            holder_id: defaults::holder_id(),
            auth: None,
        }
    }
}

impl SyncConfig {
    /// Replace the endpoint list.
    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the key-space root.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the holder identity.
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    /// Set store credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(StoreAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, SyncError> {
        toml::from_str(raw).context(ConfigParseSnafu)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `CONCLAVE_SYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are ignored.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(nodes) = non_empty(ENV_NODES) {
            self.nodes = nodes.split(',').map(|node| node.trim().to_string()).filter(|node| !node.is_empty()).collect();
        }
        if let Some(prefix) = non_empty(ENV_PREFIX) {
            self.prefix = prefix.trim().to_string();
        }
        if let Some(holder_id) = non_empty(ENV_HOLDER_ID) {
            self.holder_id = holder_id.trim().to_string();
        }
        self
    }

    /// Check the settings before any key is built from them.
    pub fn validate(&self) -> Result<(), SyncError> {
        let prefix = normalize_prefix(&self.prefix);
        if prefix.is_empty() {
            return InvalidConfigSnafu {
                reason: "prefix must name a key-space root, not '/' or ''",
            }
            .fail();
        }
        if !prefix.starts_with('/') {
            return InvalidConfigSnafu {
                reason: format!("prefix '{}' must start with '/'", self.prefix),
            }
            .fail();
        }
        if self.holder_id.trim().is_empty() {
            return InvalidConfigSnafu {
                reason: "holder_id must not be empty",
            }
            .fail();
        }
        Ok(())
    }

    /// Endpoints with a scheme, skipping blanks. Falls back to the default endpoint.
    pub fn endpoints(&self) -> Vec<String> {
        let endpoints: Vec<String> = self
            .nodes
            .iter()
            .map(|node| node.trim())
            .filter(|node| !node.is_empty())
            .map(|node| {
                if node.contains("://") {
                    node.to_string()
                } else {
                    format!("http://{node}")
                }
            })
            .collect();
        if endpoints.is_empty() {
            vec![DEFAULT_ENDPOINT.to_string()]
        } else {
            endpoints
        }
    }

    /// The prefix with trailing separators removed.
    pub fn key_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config.nodes, vec![DEFAULT_ENDPOINT.to_string()]);
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert!(!config.holder_id.is_empty());
        assert!(config.auth.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn each_default_config_gets_its_own_holder_id() {
        assert_ne!(SyncConfig::default().holder_id, SyncConfig::default().holder_id);
    }

    #[test]
    fn parses_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            nodes = ["10.0.0.1:2379", "https://10.0.0.2:2379"]
            prefix = "/app/sync/"
            holder_id = "worker-7"

            [auth]
            username = "root"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoints(), vec!["http://10.0.0.1:2379", "https://10.0.0.2:2379"]);
        assert_eq!(config.key_prefix(), "/app/sync");
        assert_eq!(config.holder_id, "worker-7");
        assert_eq!(config.auth.unwrap().username, "root");
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = SyncConfig::from_toml_str("nodes = 5").unwrap_err();
        assert!(matches!(err, SyncError::ConfigParse { .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prefix = \"/from/file\"").unwrap();
        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.prefix, "/from/file");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, SyncError::ConfigRead { .. }));
    }

    #[test]
    fn env_overrides_replace_fields() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_NODES, "a:2379, ,b:2379"),
            (ENV_PREFIX, "/env/prefix"),
            (ENV_HOLDER_ID, ""),
        ]);
        let config = SyncConfig::default()
            .with_holder_id("kept")
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.nodes, vec!["a:2379", "b:2379"]);
        assert_eq!(config.prefix, "/env/prefix");
        assert_eq!(config.holder_id, "kept");
    }

    #[test]
    fn blank_nodes_fall_back_to_default_endpoint() {
        let config = SyncConfig::default().with_nodes(["", "  "]);
        assert_eq!(config.endpoints(), vec![DEFAULT_ENDPOINT.to_string()]);
    }

    #[test]
    fn validate_rejects_bad_prefixes() {
        for prefix in ["", "/", "relative/prefix"] {
            let err = SyncConfig::default().with_prefix(prefix).validate().unwrap_err();
            assert!(matches!(err, SyncError::InvalidConfig { .. }), "prefix {prefix:?}");
        }
    }

    #[test]
    fn validate_rejects_blank_holder_id() {
        let err = SyncConfig::default().with_holder_id(" ").validate().unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
    }
}
