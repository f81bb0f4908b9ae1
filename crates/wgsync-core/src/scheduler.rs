//! Periodic driver for the reconciler.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use wgsync_wireguard::WireGuardDevice;

use crate::directory::Directory;
use crate::error::Result;
use crate::firewall::FirewallControl;
use crate::reconciler::{CycleReport, Reconciler};
use crate::snapshot::ReconciliationState;

/// Where the loop is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Not yet started.
    Idle,
    /// Reading the directory and the device.
    Fetching,
    /// Computing actions.
    Diffing,
    /// Changing the firewall and the device.
    Applying,
    /// Waiting for the next tick.
    Sleeping,
}

impl CyclePhase {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::Sleeping => "sleeping",
        }
    }

    pub(crate) fn trace(self) {
        debug!(phase = self.as_str(), "cycle phase");
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs reconciliation cycles one at a time on a fixed interval.
#[derive(Debug)]
pub struct Scheduler<D, W, F> {
    reconciler: Reconciler<D, W, F>,
    state: ReconciliationState,
    interval: Duration,
    cycles: u64,
}

impl<D, W, F> Scheduler<D, W, F>
where
    D: Directory,
    W: WireGuardDevice,
    F: FirewallControl,
{
    /// Creates a scheduler starting with no prior knowledge.
    pub fn new(reconciler: Reconciler<D, W, F>, interval: Duration) -> Self {
        CyclePhase::Idle.trace();
        Self {
            reconciler,
            state: ReconciliationState::new(),
            interval,
            cycles: 0,
        }
    }

    /// State carried into the next cycle.
    pub const fn state(&self) -> &ReconciliationState {
        &self.state
    }

    /// The reconciler being driven.
    pub const fn reconciler(&self) -> &Reconciler<D, W, F> {
        &self.reconciler
    }

    /// Number of cycles started.
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Runs one cycle. On failure the carried state is left as it was.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the cycle.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let (next, report) = self.reconciler.run_cycle(&self.state).await?;
        self.state = next;
        Ok(report)
    }

    /// Runs cycles until `shutdown` fires or its sender is dropped.
    ///
    /// The first cycle starts immediately. A cycle that overruns the interval
    /// is followed straight away by the next one, without catching up on
    /// missed ticks. Shutdown is only observed between cycles.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "sync loop started");

        loop {
            CyclePhase::Sleeping.trace();
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!(cycles = self.cycles, "shutdown signal received, stopping sync loop");
                    break;
                }
            }

            if let Err(e) = self.run_once().await {
                warn!(cycle = self.cycles, error = %e, transient = e.is_transient(), "cycle aborted");
            }
        }

        CyclePhase::Idle.trace();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::time::Instant;
    use wgsync_wireguard::{FakeWireGuardDevice, PresharedKey, PublicKey};

    use super::*;
    use crate::config::SyncConfig;
    use crate::directory::MemoryDirectory;
    use crate::firewall::MemoryFirewall;
    use crate::peer::PeerRecord;

    /// Directory whose first read takes `first_read`; later reads are instant.
    #[derive(Clone)]
    struct SlowDirectory {
        origin: Instant,
        first_read: Duration,
        reads: Arc<AtomicUsize>,
        starts: Arc<Mutex<Vec<u64>>>,
    }

    impl SlowDirectory {
        fn new(first_read: Duration) -> Self {
            Self {
                origin: Instant::now(),
                first_read,
                reads: Arc::new(AtomicUsize::new(0)),
                starts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn starts(&self) -> Vec<u64> {
            self.starts.lock().clone()
        }
    }

    impl Directory for SlowDirectory {
        async fn list_authorized_peers(&self) -> Result<Vec<PeerRecord>> {
            self.starts.lock().push(self.origin.elapsed().as_secs());
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.first_read).await;
            }
            Ok(Vec::new())
        }
    }

    async fn scheduler(
        directory: &MemoryDirectory,
        interval: Duration,
    ) -> Scheduler<MemoryDirectory, FakeWireGuardDevice, Arc<MemoryFirewall>> {
        let reconciler = Reconciler::new(
            directory.clone(),
            FakeWireGuardDevice::with_device("wg0").await,
            Arc::new(MemoryFirewall::new()),
            &SyncConfig::default(),
        );
        Scheduler::new(reconciler, interval)
    }

    #[test]
    fn phase_names() {
        assert_eq!(CyclePhase::Fetching.to_string(), "fetching");
        assert_eq!(CyclePhase::Sleeping.as_str(), "sleeping");
    }

    #[tokio::test]
    async fn run_once_keeps_state_on_failure() {
        let directory = MemoryDirectory::new(Ipv4Addr::new(10, 8, 0, 2));
        directory
            .provision(
                PublicKey::from_bytes_array([1; 32]),
                "alice",
                PresharedKey::from_bytes_array([0; 32]),
                Vec::new(),
                false,
            )
            .expect("provision");
        let mut scheduler = scheduler(&directory, Duration::from_secs(30)).await;

        scheduler.run_once().await.expect("first cycle");
        assert_eq!(scheduler.state().len(), 1);

        directory.set_fail_reads(true);
        assert!(scheduler.run_once().await.is_err());
        assert_eq!(scheduler.state().len(), 1);
        assert_eq!(scheduler.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_shutdown() {
        let directory = MemoryDirectory::new(Ipv4Addr::new(10, 8, 0, 2));
        let mut scheduler = scheduler(&directory, Duration::from_secs(30)).await;
        let (tx, rx) = broadcast::channel(1);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(65)).await;
            let _ = tx.send(());
        });

        scheduler.run(rx).await;
        stopper.await.expect("stopper task");

        // Ticks at 0s, 30s and 60s.
        assert_eq!(scheduler.cycles(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycle_is_not_caught_up() {
        let directory = SlowDirectory::new(Duration::from_secs(75));
        let reconciler = Reconciler::new(
            directory.clone(),
            FakeWireGuardDevice::with_device("wg0").await,
            Arc::new(MemoryFirewall::new()),
            &SyncConfig::default(),
        );
        let mut scheduler = Scheduler::new(reconciler, Duration::from_secs(30));
        let (tx, rx) = broadcast::channel(1);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(200)).await;
            let _ = tx.send(());
        });

        scheduler.run(rx).await;
        stopper.await.expect("stopper task");

        // The 30s and 60s ticks missed during the first cycle collapse into
        // one start at 75s, and the schedule restarts from there.
        assert_eq!(directory.starts(), vec![0, 75, 105, 135, 165, 195]);
        assert_eq!(scheduler.cycles(), 6);
    }

    #[tokio::test]
    async fn dropped_sender_stops_loop() {
        let directory = MemoryDirectory::new(Ipv4Addr::new(10, 8, 0, 2));
        let mut scheduler = scheduler(&directory, Duration::from_secs(3600)).await;
        let (tx, rx) = broadcast::channel::<()>(1);
        drop(tx);

        scheduler.run(rx).await;
        assert!(scheduler.cycles() <= 1);
    }
}
