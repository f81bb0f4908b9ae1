//! Per-peer firewall chains.
//!
//! Every peer gets a chain in the `filter` table named after its client
//! address. The chain holds one ACCEPT per allowed route, optionally followed
//! by the full-internet tail, and is entered from `FORWARD` through a single
//! jump matching the client's source address.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::firewall::{FORWARD_CHAIN, FirewallControl, FirewallError};
use crate::peer::{PeerRecord, Protocol, RouteRule};

/// Private ranges blocked ahead of the full-internet ACCEPT.
const PRIVATE_RANGES: [Ipv4Net; 3] = [
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
];

const ANYWHERE: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0);

/// Position of the peer jump in `FORWARD`.
const JUMP_POSITION: u32 = 1;

/// What a chain rule does with matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let the packet through.
    Accept,
    /// Discard the packet.
    Drop,
}

impl Verdict {
    /// iptables target name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule spec that does not describe a [`ChainRule`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized chain rule '{rule}': {reason}")]
pub struct RuleParseError {
    rule: String,
    reason: String,
}

impl RuleParseError {
    fn new(args: &[String], reason: impl Into<String>) -> Self {
        Self {
            rule: args.join(" "),
            reason: reason.into(),
        }
    }
}

/// One rule inside a peer chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainRule {
    /// Source match, the client's `/32`.
    pub source: Ipv4Net,
    /// Destination match.
    pub destination: Ipv4Net,
    /// Protocol and destination port, when the rule is scoped to a service.
    pub service: Option<(Protocol, u16)>,
    /// Outgoing interface match.
    pub out_interface: String,
    /// Target.
    pub verdict: Verdict,
}

impl ChainRule {
    /// Rule spec arguments, in the order iptables prints them back.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.source.to_string()];
        if let Some((protocol, port)) = self.service {
            args.extend([
                "-p".to_string(),
                protocol.as_str().to_string(),
                "--dport".to_string(),
                port.to_string(),
            ]);
        }
        args.extend([
            "-d".to_string(),
            self.destination.to_string(),
            "-o".to_string(),
            self.out_interface.clone(),
            "-j".to_string(),
            self.verdict.as_str().to_string(),
        ]);
        args
    }

    /// Parses arguments produced by [`Self::to_args`] (in any order).
    ///
    /// # Errors
    ///
    /// Returns [`RuleParseError`] for unknown flags, missing values, or a
    /// rule without source, destination, interface or verdict.
    pub fn from_args(args: &[String]) -> std::result::Result<Self, RuleParseError> {
        let mut source = None;
        let mut destination = None;
        let mut protocol = None;
        let mut port = None;
        let mut out_interface = None;
        let mut verdict = None;

        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let value = iter
                .next()
                .ok_or_else(|| RuleParseError::new(args, format!("{flag} has no value")))?;
            let bad = |what: &str| RuleParseError::new(args, format!("invalid {what} '{value}'"));
            match flag.as_str() {
                "-s" => source = Some(value.parse::<Ipv4Net>().map_err(|_| bad("source"))?),
                "-d" => {
                    destination = Some(value.parse::<Ipv4Net>().map_err(|_| bad("destination"))?);
                }
                "-p" => protocol = Some(value.parse::<Protocol>().map_err(|_| bad("protocol"))?),
                "--dport" => port = Some(value.parse::<u16>().map_err(|_| bad("port"))?),
                "-o" => out_interface = Some(value.clone()),
                "-j" => {
                    verdict = Some(match value.as_str() {
                        "ACCEPT" => Verdict::Accept,
                        "DROP" => Verdict::Drop,
                        _ => return Err(bad("target")),
                    });
                }
                other => return Err(RuleParseError::new(args, format!("unknown flag {other}"))),
            }
        }

        let service = match (protocol, port) {
            (Some(protocol), Some(port)) => Some((protocol, port)),
            (None, None) => None,
            _ => return Err(RuleParseError::new(args, "protocol and port must appear together")),
        };
        let missing = |what: &str| RuleParseError::new(args, format!("missing {what}"));

        Ok(Self {
            source: source.ok_or_else(|| missing("source"))?,
            destination: destination.ok_or_else(|| missing("destination"))?,
            service,
            out_interface: out_interface.ok_or_else(|| missing("out interface"))?,
            verdict: verdict.ok_or_else(|| missing("target"))?,
        })
    }
}

/// Chain name for a client address.
#[must_use]
pub fn chain_name(address: Ipv4Addr) -> String {
    address.to_string()
}

fn jump_rule(address: Ipv4Addr) -> Vec<String> {
    vec![
        "-s".to_string(),
        Ipv4Net::from(address).to_string(),
        "-j".to_string(),
        chain_name(address),
    ]
}

/// Re-derives the allowed routes from a chain's rules.
///
/// Reads ACCEPT rules up to the first DROP, which is where the full-internet
/// tail begins.
#[must_use]
pub fn effective_routes(rules: &[ChainRule]) -> Vec<RouteRule> {
    rules
        .iter()
        .take_while(|rule| rule.verdict == Verdict::Accept)
        .map(|rule| match rule.service {
            Some((protocol, port)) => RouteRule::service(rule.destination, protocol, port),
            None => RouteRule::all(rule.destination),
        })
        .collect()
}

/// Builds and replaces per-peer chains.
#[derive(Debug)]
pub struct ChainManager<F> {
    firewall: F,
    external_interface: String,
    default_routes: Vec<RouteRule>,
    allow_full_internet: bool,
}

impl<F: FirewallControl> ChainManager<F> {
    /// Creates a manager applying `config`'s forwarding policy.
    pub fn new(firewall: F, config: &SyncConfig) -> Self {
        Self {
            firewall,
            external_interface: config.external_interface.clone(),
            default_routes: config.default_routes.clone(),
            allow_full_internet: config.allow_full_internet,
        }
    }

    /// The underlying firewall.
    pub const fn firewall(&self) -> &F {
        &self.firewall
    }

    fn rule(
        &self,
        source: Ipv4Net,
        destination: Ipv4Net,
        service: Option<(Protocol, u16)>,
        verdict: Verdict,
    ) -> ChainRule {
        ChainRule {
            source,
            destination,
            service,
            out_interface: self.external_interface.clone(),
            verdict,
        }
    }

    /// The ordered rules `peer`'s chain should contain.
    #[must_use]
    pub fn build_rules(&self, peer: &PeerRecord) -> Vec<ChainRule> {
        let source = Ipv4Net::from(peer.client_address);
        let routes = if peer.routes.is_empty() && !peer.split_tunnel {
            &self.default_routes
        } else {
            &peer.routes
        };

        let mut rules: Vec<ChainRule> = routes
            .iter()
            .map(|route| {
                let service = route.protocol().zip(route.port());
                self.rule(source, route.destination(), service, Verdict::Accept)
            })
            .collect();

        if !peer.split_tunnel && self.allow_full_internet {
            rules.extend(
                PRIVATE_RANGES
                    .iter()
                    .map(|range| self.rule(source, *range, None, Verdict::Drop)),
            );
            rules.push(self.rule(source, ANYWHERE, None, Verdict::Accept));
        }

        rules
    }

    /// Replaces `peer`'s chain and its `FORWARD` jump.
    ///
    /// Any existing chain for the address is removed first, so calling this
    /// twice leaves the same rules and a single jump.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Firewall`] on the first failed operation; the
    /// chain may then be partially built and is rebuilt on the next attempt.
    pub fn create_or_replace(&self, peer: &PeerRecord) -> Result<()> {
        let address = peer.client_address;
        let chain = chain_name(address);
        let wrap = |source| SyncError::Firewall { address, source };

        self.remove(address)?;

        self.firewall.new_chain(&chain).map_err(wrap)?;
        let rules = self.build_rules(peer);
        for rule in &rules {
            self.firewall.append(&chain, &rule.to_args()).map_err(wrap)?;
        }
        self.firewall
            .insert(FORWARD_CHAIN, JUMP_POSITION, &jump_rule(address))
            .map_err(wrap)?;

        info!(
            peer = %peer.public_key,
            profile = %peer.profile_name,
            chain = %chain,
            rules = rules.len(),
            "chain applied"
        );
        Ok(())
    }

    /// Removes the chain for `address` and its `FORWARD` jump.
    ///
    /// A chain that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Firewall`] if listing, flushing or deleting the
    /// chain fails.
    pub fn remove(&self, address: Ipv4Addr) -> Result<()> {
        let chain = chain_name(address);
        let wrap = |source| SyncError::Firewall { address, source };

        let chains = self.firewall.list_chains().map_err(wrap)?;
        if !chains.iter().any(|c| *c == chain) {
            debug!(chain = %chain, "no chain to remove");
            return Ok(());
        }

        ignore_not_found(self.firewall.clear_chain(&chain)).map_err(wrap)?;
        match self.firewall.delete(FORWARD_CHAIN, &jump_rule(address)) {
            Ok(()) => {}
            Err(FirewallError::NotFound { .. }) => {
                warn!(chain = %chain, "forward jump already missing");
            }
            Err(e) => return Err(wrap(e)),
        }
        ignore_not_found(self.firewall.delete_chain(&chain)).map_err(wrap)?;

        debug!(chain = %chain, "chain removed");
        Ok(())
    }
}

fn ignore_not_found(result: std::result::Result<(), FirewallError>) -> std::result::Result<(), FirewallError> {
    match result {
        Err(FirewallError::NotFound { .. }) => Ok(()),
        other => other,
    }
}
