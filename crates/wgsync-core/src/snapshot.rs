//! Directory snapshots and the state carried between reconciliation cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use wgsync_wireguard::PublicKey;

use crate::error::{Result, SyncError};
use crate::peer::PeerRecord;

/// A validated, keyed view of one directory read.
///
/// Only active records are kept. Public keys and client addresses are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    peers: BTreeMap<PublicKey, PeerRecord>,
}

impl DirectorySnapshot {
    /// Builds a snapshot from the records a directory returned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DirectoryInconsistent`] if two active records
    /// share a public key or a client address.
    pub fn from_records(records: impl IntoIterator<Item = PeerRecord>) -> Result<Self> {
        let mut peers = BTreeMap::new();
        let mut addresses: HashMap<Ipv4Addr, String> = HashMap::new();

        for record in records.into_iter().filter(|r| r.active) {
            if let Some(other) = addresses.insert(record.client_address, record.profile_name.clone()) {
                return Err(SyncError::DirectoryInconsistent(format!(
                    "client address {} assigned to both '{other}' and '{}'",
                    record.client_address, record.profile_name
                )));
            }
            let key = record.public_key;
            if let Some(other) = peers.insert(key, record) {
                return Err(SyncError::DirectoryInconsistent(format!(
                    "public key {} used by more than one record (including '{}')",
                    key.short(),
                    other.profile_name
                )));
            }
        }

        Ok(Self { peers })
    }

    /// Looks up a record by public key.
    #[must_use]
    pub fn get(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    /// Whether a record with this key exists.
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Iterates over records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Iterates over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.peers.keys()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// What the previous cycle applied, per peer.
///
/// Lives only in memory and starts empty, meaning "no prior knowledge".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    applied: DirectorySnapshot,
}

impl ReconciliationState {
    /// State with no prior knowledge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The record last applied for a peer.
    #[must_use]
    pub fn get(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.applied.get(key)
    }

    /// Number of peers remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// The next cycle's state.
    ///
    /// The fresh snapshot replaces the previous one, except that peers in
    /// `failed` keep whatever was previously applied for them (or nothing),
    /// so their change is retried next cycle.
    #[must_use]
    pub fn advance(self, fresh: DirectorySnapshot, failed: &BTreeSet<PublicKey>) -> Self {
        if failed.is_empty() {
            return Self { applied: fresh };
        }

        let mut previous = self.applied.peers;
        let mut peers = fresh.peers;
        for key in failed {
            match previous.remove(key) {
                Some(old) if peers.contains_key(key) => {
                    peers.insert(*key, old);
                }
                _ => {
                    peers.remove(key);
                }
            }
        }
        Self {
            applied: DirectorySnapshot { peers },
        }
    }
}

impl From<DirectorySnapshot> for ReconciliationState {
    fn from(applied: DirectorySnapshot) -> Self {
        Self { applied }
    }
}
