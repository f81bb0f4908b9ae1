//! Core types for `WireGuard` device state and peer configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PublicKey};

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedIp {
    network: IpNet,
}

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// A single-host `/32` entry for an IPv4 address.
    #[must_use]
    pub fn host_v4(addr: Ipv4Addr) -> Self {
        Self {
            network: IpNet::V4(Ipv4Net::from(addr)),
        }
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Returns the address when this entry names exactly one IPv4 host.
    #[must_use]
    pub fn as_host_v4(&self) -> Option<Ipv4Addr> {
        match self.network {
            IpNet::V4(net) if net.prefix_len() == 32 => Some(net.addr()),
            _ => None,
        }
    }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let network = s
            .parse::<IpNet>()
            .map_err(|e| WireGuardError::InvalidCidr(format!("{s}: {e}")))?;
        Ok(Self { network })
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String {
        self.network.to_string()
    }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Desired configuration for one peer on the gateway device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// IP addresses/networks this peer may source traffic from.
    pub allowed_ips: Vec<AllowedIp>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
        }
    }

    /// Sets the preshared key.
    #[must_use]
    pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }
}

/// One change in a batched device reconfiguration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerUpdate {
    /// Add (or overwrite) a peer.
    Add(PeerConfig),
    /// Remove the peer with this key.
    Remove(PublicKey),
}

impl PeerUpdate {
    /// The public key this update applies to.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Self::Add(config) => &config.public_key,
            Self::Remove(key) => key,
        }
    }
}

/// A peer as currently configured on the live device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivePeer {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Configured allowed IPs.
    pub allowed_ips: Vec<AllowedIp>,
}

impl LivePeer {
    /// The first single-host IPv4 allowed IP, which is the client address
    /// the gateway assigned to this peer.
    #[must_use]
    pub fn client_address(&self) -> Option<Ipv4Addr> {
        self.allowed_ips.iter().find_map(AllowedIp::as_host_v4)
    }
}

/// Read-only view of a live `WireGuard` device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Interface name.
    pub name: String,
    /// Peers keyed by public key.
    pub peers: BTreeMap<PublicKey, LivePeer>,
}

impl DeviceSnapshot {
    /// Creates an empty snapshot for the named interface.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peers: BTreeMap::new(),
        }
    }

    /// Inserts a live peer.
    #[must_use]
    pub fn with_peer(mut self, peer: LivePeer) -> Self {
        self.peers.insert(peer.public_key, peer);
        self
    }

    /// Whether a peer with this key is configured.
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Number of configured peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the device has no peers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
