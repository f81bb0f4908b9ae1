//! Daemon configuration file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use wgsync_core::SyncConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgsync/config.json";

/// Where the directory export lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// JSON file holding the array of user records.
    pub path: PathBuf,
}

/// Top-level configuration for the `wgsync` daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Reconciliation settings.
    #[serde(default)]
    pub sync: SyncConfig,
    /// User directory source.
    pub directory: DirectoryConfig,
    /// Log level for wgsync targets when `RUST_LOG` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl GatewayConfig {
    /// A starting point for `init-config`.
    pub fn sample(directory: impl Into<PathBuf>) -> Self {
        Self {
            sync: SyncConfig {
                default_routes: vec![wgsync_core::RouteRule::all(
                    ipnet::Ipv4Net::new_assert(std::net::Ipv4Addr::new(10, 0, 0, 0), 8),
                )],
                ..SyncConfig::default()
            },
            directory: DirectoryConfig {
                path: directory.into(),
            },
            log_level: Some("info".to_string()),
        }
    }

    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid config file '{}'", path.display()))
    }

    /// Parses and validates configuration JSON.
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.sync.validate()?;

        if self.directory.path.as_os_str().is_empty() {
            anyhow::bail!("directory.path cannot be empty");
        }

        if let Some(level) = &self.log_level {
            level
                .parse::<tracing::Level>()
                .map_err(|_| anyhow::anyhow!("log_level '{level}' is not a valid level"))?;
        }

        Ok(())
    }

    /// Writes the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file '{}'", path.display()))
    }
}
