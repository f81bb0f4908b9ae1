//! Error types for the reconciliation core.

use std::net::Ipv4Addr;

use thiserror::Error;
use wgsync_wireguard::WireGuardError;

use crate::firewall::FirewallError;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while reconciling the gateway with the directory.
///
/// Everything except [`SyncError::ConfigurationInvalid`] is transient: the
/// affected step (or peer) is skipped and retried on the next cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The directory could not be read in full.
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The directory returned a snapshot that violates record uniqueness.
    #[error("directory snapshot inconsistent: {0}")]
    DirectoryInconsistent(String),

    /// The live device could not be read.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[source] WireGuardError),

    /// The batched device reconfiguration failed.
    #[error("device configuration failed: {0}")]
    DeviceConfig(#[source] WireGuardError),

    /// A firewall operation for one peer's chain failed.
    #[error("firewall error on chain {address}: {source}")]
    Firewall {
        /// Client address naming the chain.
        address: Ipv4Addr,
        /// Underlying firewall failure.
        #[source]
        source: FirewallError,
    },

    /// Startup configuration is unusable.
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),
}

impl SyncError {
    /// Whether the next cycle may succeed without operator action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ConfigurationInvalid(_))
    }
}
