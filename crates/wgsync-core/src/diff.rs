//! Diff engine: turns three views of peer state into an ordered action list.

use std::fmt;

use wgsync_wireguard::{DeviceSnapshot, LivePeer, PublicKey};

use crate::peer::PeerRecord;
use crate::snapshot::{DirectorySnapshot, ReconciliationState};

/// One reconciliation step for a single peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Peer is configured on the device but no longer in the directory.
    Remove(LivePeer),
    /// Peer is in the directory but missing from the device.
    Add(PeerRecord),
    /// Peer is on both sides and its routes changed since the last cycle.
    UpdateRoutes(PeerRecord),
}

impl Action {
    /// The public key the action applies to.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Self::Remove(peer) => &peer.public_key,
            Self::Add(record) | Self::UpdateRoutes(record) => &record.public_key,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Remove(_) => "remove",
            Self::Add(_) => "add",
            Self::UpdateRoutes(_) => "update-routes",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.public_key().short())
    }
}

/// Computes the actions that bring the device and firewall to `fresh`.
///
/// Keys are partitioned into fresh-only, live-only and shared before being
/// classified, so a key produces at most one action. The result holds every
/// `Remove` first, then every `Add`, then every `UpdateRoutes`; each group is
/// in public-key order.
#[must_use]
pub fn compute_actions(
    previous: &ReconciliationState,
    live: &DeviceSnapshot,
    fresh: &DirectorySnapshot,
) -> Vec<Action> {
    let removes = live
        .peers
        .values()
        .filter(|peer| !fresh.contains(&peer.public_key))
        .map(|peer| Action::Remove(peer.clone()));

    let mut adds = Vec::new();
    let mut updates = Vec::new();
    for record in fresh.iter() {
        if !live.contains(&record.public_key) {
            adds.push(Action::Add(record.clone()));
        } else if previous
            .get(&record.public_key)
            .is_none_or(|prior| record.serial > prior.serial)
        {
            updates.push(Action::UpdateRoutes(record.clone()));
        }
    }

    removes.chain(adds).chain(updates).collect()
}
