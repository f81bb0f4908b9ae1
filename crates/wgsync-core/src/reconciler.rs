//! One reconciliation cycle.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, error, info, warn};
use wgsync_wireguard::{PublicKey, WireGuardDevice};

use crate::chain::ChainManager;
use crate::config::SyncConfig;
use crate::configurator::DeviceConfigurator;
use crate::diff::{Action, compute_actions};
use crate::directory::Directory;
use crate::error::{Result, SyncError};
use crate::firewall::FirewallControl;
use crate::scheduler::CyclePhase;
use crate::snapshot::{DirectorySnapshot, ReconciliationState};

/// What a completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Active records in the directory.
    pub directory_peers: usize,
    /// Peers on the device before the cycle.
    pub device_peers: usize,
    /// Peers removed (firewall done, device removal queued).
    pub removed: usize,
    /// Peers added (firewall done, device addition queued).
    pub added: usize,
    /// Peers whose chain was rebuilt for changed routes.
    pub routes_updated: usize,
    /// Updates sent in the device batch.
    pub device_updates: usize,
    /// Peers whose firewall step failed and will be retried.
    pub failed: BTreeSet<PublicKey>,
    /// Why the device batch failed, if it did.
    pub device_error: Option<String>,
}

impl CycleReport {
    /// Whether the cycle changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed == 0
            && self.added == 0
            && self.routes_updated == 0
            && self.failed.is_empty()
            && self.device_error.is_none()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "directory={} device={} removed={} added={} routes_updated={} failed={}",
            self.directory_peers,
            self.device_peers,
            self.removed,
            self.added,
            self.routes_updated,
            self.failed.len()
        )?;
        if let Some(e) = &self.device_error {
            write!(f, " device_error=\"{e}\"")?;
        }
        Ok(())
    }
}

/// Brings the device and firewall in line with the directory.
#[derive(Debug)]
pub struct Reconciler<D, W, F> {
    directory: D,
    device: W,
    chains: ChainManager<F>,
    interface: String,
}

impl<D, W, F> Reconciler<D, W, F>
where
    D: Directory,
    W: WireGuardDevice,
    F: FirewallControl,
{
    /// Creates a reconciler for `config.wireguard_interface`.
    pub fn new(directory: D, device: W, firewall: F, config: &SyncConfig) -> Self {
        Self {
            directory,
            device,
            chains: ChainManager::new(firewall, config),
            interface: config.wireguard_interface.clone(),
        }
    }

    /// The directory being read.
    pub const fn directory(&self) -> &D {
        &self.directory
    }

    /// The device being configured.
    pub const fn device(&self) -> &W {
        &self.device
    }

    /// The firewall being configured.
    pub const fn firewall(&self) -> &F {
        self.chains.firewall()
    }

    /// Runs one cycle against `previous` and returns the state for the next.
    ///
    /// Firewall changes for one peer are applied before any other peer's;
    /// a peer whose firewall step fails is skipped for the rest of the cycle
    /// and left out of the device batch. All device changes go out in one
    /// batch at the end.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if the directory or the device
    /// cannot be read. A failed device batch is reported in the
    /// [`CycleReport`] rather than as an error, since firewall changes have
    /// already been applied by then.
    pub async fn run_cycle(
        &mut self,
        previous: &ReconciliationState,
    ) -> Result<(ReconciliationState, CycleReport)> {
        CyclePhase::Fetching.trace();
        let records = self.directory.list_authorized_peers().await?;
        let fresh = DirectorySnapshot::from_records(records)?;
        let live = self
            .device
            .get_device(&self.interface)
            .await
            .map_err(SyncError::DeviceUnavailable)?;

        CyclePhase::Diffing.trace();
        let actions = compute_actions(previous, &live, &fresh);
        debug!(
            directory = fresh.len(),
            device = live.len(),
            actions = actions.len(),
            "diff computed"
        );

        CyclePhase::Applying.trace();
        let mut report = CycleReport {
            directory_peers: fresh.len(),
            device_peers: live.len(),
            ..CycleReport::default()
        };
        let mut batch = DeviceConfigurator::new(&self.interface);

        for action in &actions {
            let key = *action.public_key();
            if let Err(e) = self.apply_firewall(action, previous) {
                error!(peer = %key, action = action.kind(), error = %e, "peer skipped this cycle");
                report.failed.insert(key);
                continue;
            }

            match action {
                Action::Remove(_) => {
                    batch.queue_remove(key);
                    report.removed += 1;
                }
                Action::Add(record) => {
                    batch.queue_add(record);
                    report.added += 1;
                }
                Action::UpdateRoutes(_) => report.routes_updated += 1,
            }
        }

        match batch.apply(&mut self.device).await {
            Ok(applied) => report.device_updates = applied,
            Err(e) => {
                error!(interface = %self.interface, error = %e, "device batch failed, will retry");
                report.device_error = Some(e.to_string());
            }
        }

        let next = previous.clone().advance(fresh, &report.failed);
        if report.is_noop() {
            debug!("gateway already in sync");
        } else {
            info!(%report, "cycle complete");
        }
        Ok((next, report))
    }

    fn apply_firewall(&self, action: &Action, previous: &ReconciliationState) -> Result<()> {
        match action {
            Action::Remove(peer) => {
                let address = peer.client_address().or_else(|| {
                    previous
                        .get(&peer.public_key)
                        .map(|record| record.client_address)
                });
                match address {
                    Some(address) => self.chains.remove(address),
                    None => {
                        warn!(peer = %peer.public_key, "no client address known, skipping chain removal");
                        Ok(())
                    }
                }
            }
            Action::Add(record) | Action::UpdateRoutes(record) => {
                self.chains.create_or_replace(record)
            }
        }
    }
}
