//! Directory peer records and their route rules.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use wgsync_wireguard::{PresharedKey, PublicKey};

/// Errors produced when parsing a route rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteParseError {
    /// The destination is not an IPv4 address or network.
    #[error("invalid destination '{0}'")]
    Destination(String),

    /// The `PORT/PROTO` part is malformed.
    #[error("invalid service '{0}', expected PORT/PROTO")]
    Service(String),

    /// The protocol is not supported.
    #[error("unsupported protocol '{0}'")]
    Protocol(String),
}

/// Transport protocol a route rule can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Lowercase name, as iptables spells it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(RouteParseError::Protocol(other.to_string())),
        }
    }
}

/// One destination a peer may reach through the gateway.
///
/// A rule either allows all traffic to `destination`, or only traffic with
/// the given protocol and destination port. Written as `DEST` or
/// `DEST->PORT/PROTO`, e.g. `10.0.0.0/8->22/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteRule {
    destination: Ipv4Net,
    service: Option<(Protocol, u16)>,
}

impl RouteRule {
    /// Allows all traffic to `destination`.
    #[must_use]
    pub fn all(destination: Ipv4Net) -> Self {
        Self {
            destination: destination.trunc(),
            service: None,
        }
    }

    /// Allows only `protocol` traffic to `port` on `destination`.
    #[must_use]
    pub fn service(destination: Ipv4Net, protocol: Protocol, port: u16) -> Self {
        Self {
            destination: destination.trunc(),
            service: Some((protocol, port)),
        }
    }

    /// Destination network.
    #[must_use]
    pub const fn destination(&self) -> Ipv4Net {
        self.destination
    }

    /// Transport protocol, if the rule is scoped.
    #[must_use]
    pub fn protocol(&self) -> Option<Protocol> {
        self.service.map(|(p, _)| p)
    }

    /// Destination port, if the rule is scoped.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.service.map(|(_, p)| p)
    }
}

fn parse_destination(s: &str) -> Result<Ipv4Net, RouteParseError> {
    let s = s.trim();
    if s.contains('/') {
        s.parse::<Ipv4Net>()
            .map(|n| n.trunc())
            .map_err(|_| RouteParseError::Destination(s.to_string()))
    } else {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Net::from)
            .map_err(|_| RouteParseError::Destination(s.to_string()))
    }
}

impl FromStr for RouteRule {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("->") {
            None => Ok(Self::all(parse_destination(s)?)),
            Some((dest, service)) => {
                let destination = parse_destination(dest)?;
                let (port, proto) = service
                    .trim()
                    .split_once('/')
                    .ok_or_else(|| RouteParseError::Service(service.to_string()))?;
                let port = port
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| RouteParseError::Service(service.to_string()))?;
                Ok(Self::service(destination, proto.parse()?, port))
            }
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service {
            None => write!(f, "{}", self.destination),
            Some((proto, port)) => write!(f, "{}->{port}/{proto}", self.destination),
        }
    }
}

impl Serialize for RouteRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RouteRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a comma-separated route list such as
/// `1.1.1.1/32->22/tcp,2.0.0.0/8`. Empty entries are ignored.
///
/// # Errors
///
/// Returns the first entry that fails to parse.
pub fn parse_route_list(s: &str) -> Result<Vec<RouteRule>, RouteParseError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

const fn default_active() -> bool {
    true
}

/// One authorized VPN user as recorded in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's `WireGuard` public key; unique across the directory.
    pub public_key: PublicKey,
    /// Operator-facing profile name.
    pub profile_name: String,
    /// Preshared key configured alongside the public key.
    pub preshared_key: PresharedKey,
    /// Address assigned to the client from the pool; unique across the directory.
    pub client_address: Ipv4Addr,
    /// Destinations this peer may reach.
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    /// Whether the client only routes the allowed destinations.
    #[serde(default)]
    pub split_tunnel: bool,
    /// Version bumped by the directory whenever the routes change.
    #[serde(default)]
    pub serial: u64,
    /// Inactive records are ignored by the gateway.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Contact address, kept for listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl PeerRecord {
    /// Creates an active record with no routes and serial 0.
    #[must_use]
    pub fn new(
        public_key: PublicKey,
        profile_name: impl Into<String>,
        preshared_key: PresharedKey,
        client_address: Ipv4Addr,
    ) -> Self {
        Self {
            public_key,
            profile_name: profile_name.into(),
            preshared_key,
            client_address,
            routes: Vec::new(),
            split_tunnel: false,
            serial: 0,
            active: true,
            email: None,
        }
    }

    /// Adds a route.
    #[must_use]
    pub fn with_route(mut self, route: RouteRule) -> Self {
        self.routes.push(route);
        self
    }

    /// Sets the split-tunnel flag.
    #[must_use]
    pub fn with_split_tunnel(mut self, split_tunnel: bool) -> Self {
        self.split_tunnel = split_tunnel;
        self
    }

    /// Sets the serial.
    #[must_use]
    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }
}
