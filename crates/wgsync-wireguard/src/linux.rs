//! Linux kernel `WireGuard` device using the netlink API.
//!
//! Wraps `defguard_wireguard_rs` to implement [`WireGuardDevice`] against an
//! interface that already exists on the host. Creating and addressing the
//! interface is left to the host's network configuration.

use std::str::FromStr;
use std::time::Instant;

use defguard_wireguard_rs::host::Peer as DgPeer;
use defguard_wireguard_rs::key::Key as DgKey;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{Kernel, WGApi, WireguardInterfaceApi};
use tracing::{debug, warn};

use crate::device::WireGuardDevice;
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, DeviceSnapshot, LivePeer, PeerConfig, PeerUpdate};

/// Kernel-backed `WireGuard` device control.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelDevice;

impl KernelDevice {
    /// Creates a new kernel device handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn api(name: &str) -> Result<WGApi<Kernel>> {
        WGApi::<Kernel>::new(name.to_string())
            .map_err(|e| WireGuardError::InterfaceError(format!("WGApi::new({name}): {e}")))
    }
}

/// Convert our `AllowedIp` to defguard's `IpAddrMask`.
fn to_ip_addr_mask(allowed_ip: &AllowedIp) -> Result<IpAddrMask> {
    IpAddrMask::from_str(&allowed_ip.to_cidr())
        .map_err(|e| WireGuardError::InvalidCidr(format!("{}: {e}", allowed_ip.to_cidr())))
}

fn to_defguard_key(bytes: &[u8; 32]) -> Result<DgKey> {
    DgKey::try_from(bytes.as_slice())
        .map_err(|e| WireGuardError::InvalidKey(format!("defguard key conversion: {e}")))
}

/// Build a defguard `Peer` from our `PeerConfig`.
fn build_defguard_peer(peer: &PeerConfig) -> Result<DgPeer> {
    let mut dg_peer = DgPeer::new(to_defguard_key(peer.public_key.as_bytes())?);

    if let Some(ref psk) = peer.preshared_key {
        dg_peer.preshared_key = Some(to_defguard_key(psk.as_bytes())?);
    }

    for aip in &peer.allowed_ips {
        dg_peer.allowed_ips.push(to_ip_addr_mask(aip)?);
    }

    Ok(dg_peer)
}

impl WireGuardDevice for KernelDevice {
    async fn get_device(&self, name: &str) -> Result<DeviceSnapshot> {
        let api = Self::api(name)?;
        let host = api
            .read_interface_data()
            .map_err(|e| WireGuardError::InterfaceError(format!("read_interface_data: {e}")))?;

        let mut snapshot = DeviceSnapshot::new(name);
        for dg_peer in host.peers.values() {
            let public_key = PublicKey::from_bytes_array(dg_peer.public_key.as_array());
            let allowed_ips = dg_peer
                .allowed_ips
                .iter()
                .filter_map(|aip| AllowedIp::from_cidr(&aip.to_string()).ok())
                .collect();
            snapshot = snapshot.with_peer(LivePeer {
                public_key,
                allowed_ips,
            });
        }

        debug!(interface = %name, peers = snapshot.len(), "read device");
        Ok(snapshot)
    }

    async fn configure_device(&mut self, name: &str, updates: &[PeerUpdate]) -> Result<()> {
        let api = Self::api(name)?;
        let started = Instant::now();

        for update in updates {
            match update {
                PeerUpdate::Add(config) => {
                    let dg_peer = build_defguard_peer(config)?;
                    api.configure_peer(&dg_peer).map_err(|e| {
                        WireGuardError::InterfaceError(format!(
                            "configure_peer {}: {e}",
                            config.public_key.short()
                        ))
                    })?;
                }
                PeerUpdate::Remove(key) => {
                    let dg_key = to_defguard_key(key.as_bytes())?;
                    if let Err(e) = api.remove_peer(&dg_key) {
                        warn!(interface = %name, peer = %key.short(), error = %e, "remove_peer failed");
                        return Err(WireGuardError::InterfaceError(format!(
                            "remove_peer {}: {e}",
                            key.short()
                        )));
                    }
                }
            }
        }

        debug!(
            interface = %name,
            updates = updates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "device reconfigured"
        );
        Ok(())
    }
}
