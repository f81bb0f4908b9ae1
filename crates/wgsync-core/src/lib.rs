//! Reconciliation core for the wgsync gateway.
//!
//! Each cycle reads the user directory and the live `WireGuard` device, works
//! out which peers must be removed, added or have their routes refreshed,
//! rebuilds the per-peer iptables chains, and applies all device changes in
//! one batch.
//!
//! # Example
//!
//! ```rust,ignore
//! use wgsync_core::{Iptables, FileDirectory, Reconciler, Scheduler, SyncConfig};
//!
//! let config = SyncConfig::default();
//! let reconciler = Reconciler::new(
//!     FileDirectory::new("/var/lib/wgsync/users.json"),
//!     device,
//!     Iptables::default(),
//!     &config,
//! );
//! let mut scheduler = Scheduler::new(reconciler, config.interval());
//! scheduler.run(shutdown_rx).await;
//! ```

pub mod chain;
pub mod config;
pub mod configurator;
pub mod diff;
pub mod directory;
pub mod error;
pub mod firewall;
pub mod peer;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;

pub use chain::{ChainManager, ChainRule, RuleParseError, Verdict, chain_name, effective_routes};
pub use config::SyncConfig;
pub use configurator::{DeviceConfigurator, peer_config};
pub use diff::{Action, compute_actions};
pub use directory::{Directory, FileDirectory, MemoryDirectory};
pub use error::{Result, SyncError};
pub use firewall::{FORWARD_CHAIN, FirewallCall, FirewallControl, FirewallError, Iptables, MemoryFirewall};
pub use peer::{PeerRecord, Protocol, RouteParseError, RouteRule, parse_route_list};
pub use reconciler::{CycleReport, Reconciler};
pub use scheduler::{CyclePhase, Scheduler};
pub use snapshot::{DirectorySnapshot, ReconciliationState};
