//! `WireGuard` device control.
//!
//! The gateway talks to exactly one device through the [`WireGuardDevice`]
//! trait: it reads the live peer table and applies batched peer changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{DeviceSnapshot, LivePeer, PeerConfig, PeerUpdate};

/// Trait for reading and configuring a `WireGuard` device.
#[allow(async_fn_in_trait)]
pub trait WireGuardDevice {
    /// Reads the live peer table of the named device.
    async fn get_device(&self, name: &str) -> Result<DeviceSnapshot>;

    /// Applies a batch of peer additions and removals in one reconfiguration.
    ///
    /// Peers not named in `updates` are left untouched.
    async fn configure_device(&mut self, name: &str, updates: &[PeerUpdate]) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
struct FakeDeviceData {
    peers: HashMap<PublicKey, PeerConfig>,
}

/// An in-memory `WireGuard` device for testing.
///
/// Clones share state, so a test can keep a handle for inspection while the
/// code under test owns another.
#[derive(Clone, Default)]
pub struct FakeWireGuardDevice {
    devices: Arc<RwLock<HashMap<String, FakeDeviceData>>>,
    configure_calls: Arc<AtomicUsize>,
    fail_reads: Arc<AtomicBool>,
    fail_configure: Arc<AtomicBool>,
}

impl FakeWireGuardDevice {
    /// Creates a fake with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fake holding one empty device.
    pub async fn with_device(name: &str) -> Self {
        let fake = Self::new();
        fake.devices
            .write()
            .await
            .insert(name.to_string(), FakeDeviceData::default());
        fake
    }

    /// Puts a peer on the device directly, bypassing the call counter.
    pub async fn insert_peer(&self, name: &str, peer: PeerConfig) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;
        device.peers.insert(peer.public_key, peer);
        Ok(())
    }

    /// Returns the stored configuration of a peer.
    pub async fn peer(&self, name: &str, key: &PublicKey) -> Option<PeerConfig> {
        self.devices
            .read()
            .await
            .get(name)
            .and_then(|d| d.peers.get(key).cloned())
    }

    /// Number of peers on the named device.
    pub async fn peer_count(&self, name: &str) -> usize {
        self.devices
            .read()
            .await
            .get(name)
            .map_or(0, |d| d.peers.len())
    }

    /// Number of `configure_device` calls made so far.
    #[must_use]
    pub fn configure_calls(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }

    /// Makes subsequent `get_device` calls fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `configure_device` calls fail.
    pub fn set_fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }
}

impl WireGuardDevice for FakeWireGuardDevice {
    async fn get_device(&self, name: &str) -> Result<DeviceSnapshot> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(WireGuardError::InterfaceError("injected read failure".to_string()));
        }

        let devices = self.devices.read().await;
        let device = devices
            .get(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;

        let mut snapshot = DeviceSnapshot::new(name);
        for config in device.peers.values() {
            snapshot = snapshot.with_peer(LivePeer {
                public_key: config.public_key,
                allowed_ips: config.allowed_ips.clone(),
            });
        }
        Ok(snapshot)
    }

    async fn configure_device(&mut self, name: &str, updates: &[PeerUpdate]) -> Result<()> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(WireGuardError::InterfaceError(
                "injected configure failure".to_string(),
            ));
        }

        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;

        for update in updates {
            match update {
                PeerUpdate::Add(config) => {
                    device.peers.insert(config.public_key, config.clone());
                }
                PeerUpdate::Remove(key) => {
                    device.peers.remove(key);
                }
            }
        }
        debug!(interface = %name, updates = updates.len(), "fake device configured");
        Ok(())
    }
}
