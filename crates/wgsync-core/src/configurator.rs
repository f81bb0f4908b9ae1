//! Batched device reconfiguration.

use tracing::{debug, info};
use wgsync_wireguard::{AllowedIp, PeerConfig, PeerUpdate, PublicKey, WireGuardDevice};

use crate::error::{Result, SyncError};
use crate::peer::PeerRecord;

/// Device configuration for a directory record: its key, preshared key and
/// client address as the single allowed IP.
#[must_use]
pub fn peer_config(record: &PeerRecord) -> PeerConfig {
    PeerConfig::new(record.public_key)
        .with_preshared_key(record.preshared_key.clone())
        .with_allowed_ip(AllowedIp::host_v4(record.client_address))
}

/// Collects one cycle's peer additions and removals and applies them in a
/// single device call.
#[derive(Debug, Clone)]
pub struct DeviceConfigurator {
    interface: String,
    removes: Vec<PeerUpdate>,
    adds: Vec<PeerUpdate>,
}

impl DeviceConfigurator {
    /// Creates an empty batch for `interface`.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            removes: Vec::new(),
            adds: Vec::new(),
        }
    }

    /// Queues removal of a peer.
    pub fn queue_remove(&mut self, key: PublicKey) {
        self.removes.push(PeerUpdate::Remove(key));
    }

    /// Queues addition of a directory record.
    pub fn queue_add(&mut self, record: &PeerRecord) {
        self.adds.push(PeerUpdate::Add(peer_config(record)));
    }

    /// Number of queued updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.removes.len() + self.adds.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.adds.is_empty()
    }

    /// The batch as it would be sent: removals first, then additions.
    #[must_use]
    pub fn updates(&self) -> Vec<PeerUpdate> {
        self.removes.iter().chain(&self.adds).cloned().collect()
    }

    /// Sends the batch with one `configure_device` call and returns the
    /// number of updates applied. An empty batch makes no call.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DeviceConfig`] if the device rejects the batch.
    pub async fn apply<W: WireGuardDevice>(&self, device: &mut W) -> Result<usize> {
        if self.is_empty() {
            debug!(interface = %self.interface, "no device changes");
            return Ok(0);
        }

        let updates = self.updates();
        device
            .configure_device(&self.interface, &updates)
            .await
            .map_err(SyncError::DeviceConfig)?;

        info!(
            interface = %self.interface,
            removed = self.removes.len(),
            added = self.adds.len(),
            "device reconfigured"
        );
        Ok(updates.len())
    }
}
