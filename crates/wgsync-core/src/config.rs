//! Settings consumed by the reconciliation core.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wgsync_wireguard::{PrivateKey, PublicKey};

use crate::error::{Result, SyncError};
use crate::peer::RouteRule;

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL).
const MAX_INTERFACE_NAME: usize = 15;

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// `WireGuard` interface whose peers are managed.
    pub wireguard_interface: String,
    /// Interface forwarded traffic leaves through.
    pub external_interface: String,
    /// Seconds between the start of consecutive cycles.
    pub sync_interval_secs: u64,
    /// Routes given to full-tunnel peers that have none of their own.
    pub default_routes: Vec<RouteRule>,
    /// Whether full-tunnel peers may reach the public internet.
    pub allow_full_internet: bool,
    /// The gateway's own private key, base64. Only checked at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_private_key: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wireguard_interface: "wg0".to_string(),
            external_interface: "eth0".to_string(),
            sync_interval_secs: 30,
            default_routes: Vec::new(),
            allow_full_internet: false,
            server_private_key: None,
        }
    }
}

fn validate_interface(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::ConfigurationInvalid(format!(
            "{field} cannot be empty"
        )));
    }
    if name.len() > MAX_INTERFACE_NAME {
        return Err(SyncError::ConfigurationInvalid(format!(
            "{field} '{name}' exceeds {MAX_INTERFACE_NAME} characters"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(SyncError::ConfigurationInvalid(format!(
            "{field} '{name}' contains whitespace or '/'"
        )));
    }
    Ok(())
}

impl SyncConfig {
    /// Time between cycle starts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Public key derived from the configured server private key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigurationInvalid`] if the key does not decode.
    pub fn server_public_key(&self) -> Result<Option<PublicKey>> {
        self.server_private_key
            .as_deref()
            .map(|encoded| {
                PrivateKey::from_base64(encoded.trim())
                    .map(|key| key.public_key())
                    .map_err(|e| {
                        SyncError::ConfigurationInvalid(format!("server_private_key: {e}"))
                    })
            })
            .transpose()
    }

    /// Checks the settings before the loop starts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigurationInvalid`] describing the first
    /// problem found.
    pub fn validate(&self) -> Result<()> {
        validate_interface("wireguard_interface", &self.wireguard_interface)?;
        validate_interface("external_interface", &self.external_interface)?;

        if self.sync_interval_secs == 0 {
            return Err(SyncError::ConfigurationInvalid(
                "sync_interval_secs must be greater than 0".to_string(),
            ));
        }

        self.server_public_key()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.wireguard_interface, "wg0");
        assert_eq!(config.external_interface, "eth0");
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert!(!config.allow_full_internet);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"external_interface": "ens5", "default_routes": ["10.0.0.0/8->22/tcp"]}"#,
        )
        .expect("parse");
        assert_eq!(config.external_interface, "ens5");
        assert_eq!(config.wireguard_interface, "wg0");
        assert_eq!(config.default_routes.len(), 1);
    }

    #[test]
    fn rejects_zero_interval() {
        let config = SyncConfig {
            sync_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn rejects_bad_interface_names() {
        for name in ["", "a-very-long-interface", "eth 0", "eth/0"] {
            let config = SyncConfig {
                external_interface: name.to_string(),
                ..SyncConfig::default()
            };
            assert!(config.validate().is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn server_key_is_checked() {
        let key = PrivateKey::from_bytes_array([7; 32]);
        let config = SyncConfig {
            server_private_key: Some(key.to_base64()),
            ..SyncConfig::default()
        };
        assert_eq!(
            config.server_public_key().expect("valid"),
            Some(key.public_key())
        );

        let config = SyncConfig {
            server_private_key: Some("not-a-key".to_string()),
            ..SyncConfig::default()
        };
        assert!(!config.validate().expect_err("invalid key").is_transient());
    }
}
