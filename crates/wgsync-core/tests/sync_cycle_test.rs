//! Full reconciliation cycles against in-memory collaborators.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use wgsync_core::{
    ChainRule, FORWARD_CHAIN, MemoryDirectory, MemoryFirewall, PeerRecord, Reconciler, RouteRule,
    Scheduler, SyncConfig, SyncError, effective_routes,
};
use wgsync_wireguard::{AllowedIp, FakeWireGuardDevice, PeerConfig, PresharedKey, PublicKey};

const POOL_START: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
const WG: &str = "wg0";

struct Harness {
    directory: MemoryDirectory,
    device: FakeWireGuardDevice,
    firewall: Arc<MemoryFirewall>,
    scheduler: Scheduler<MemoryDirectory, FakeWireGuardDevice, Arc<MemoryFirewall>>,
}

impl Harness {
    async fn new(config: &SyncConfig) -> Self {
        let directory = MemoryDirectory::new(POOL_START);
        let device = FakeWireGuardDevice::with_device(WG).await;
        Self::with_parts(directory, device, Arc::new(MemoryFirewall::new()), config)
    }

    fn with_parts(
        directory: MemoryDirectory,
        device: FakeWireGuardDevice,
        firewall: Arc<MemoryFirewall>,
        config: &SyncConfig,
    ) -> Self {
        let reconciler = Reconciler::new(
            directory.clone(),
            device.clone(),
            Arc::clone(&firewall),
            config,
        );
        Self {
            directory,
            device,
            firewall,
            scheduler: Scheduler::new(reconciler, Duration::from_secs(30)),
        }
    }

    fn provision(&self, n: u8, name: &str, routes: &[&str]) -> PeerRecord {
        let routes = routes
            .iter()
            .map(|r| r.parse::<RouteRule>().expect("route"))
            .collect();
        self.directory
            .provision(key(n), name, psk(n), routes, false)
            .expect("provision")
    }

    fn chain_rules(&self, chain: &str) -> Vec<ChainRule> {
        self.firewall
            .rules(chain)
            .expect("chain exists")
            .iter()
            .map(|r| ChainRule::from_args(r).expect("parse rule"))
            .collect()
    }

    fn forward_jumps(&self) -> Vec<Vec<String>> {
        self.firewall.rules(FORWARD_CHAIN).expect("forward chain")
    }
}

fn key(n: u8) -> PublicKey {
    PublicKey::from_bytes_array([n; 32])
}

fn psk(n: u8) -> PresharedKey {
    PresharedKey::from_bytes_array([n.wrapping_add(100); 32])
}

fn jump(address: &str) -> Vec<String> {
    ["-s", &format!("{address}/32"), "-j", address]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

#[tokio::test]
async fn first_peer_gets_pool_start() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    let record = h.provision(1, "alice", &["10.0.0.0/8"]);
    assert_eq!(record.client_address, POOL_START);

    let report = h.scheduler.run_once().await.expect("cycle");
    assert_eq!(report.added, 1);

    let peer = h.device.peer(WG, &key(1)).await.expect("peer on device");
    assert_eq!(peer.allowed_ips, vec![AllowedIp::host_v4(POOL_START)]);
    assert_eq!(peer.preshared_key, Some(psk(1)));
    assert!(h.firewall.has_chain("10.8.0.2"));
    assert_eq!(h.forward_jumps(), vec![jump("10.8.0.2")]);

    let second = h.provision(2, "bob", &[]);
    assert_eq!(second.client_address, Ipv4Addr::new(10, 8, 0, 3));
}

#[tokio::test]
async fn removed_peer_is_torn_down_in_one_batch() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "yara", &["10.0.0.0/8"]);
    h.provision(2, "zoe", &["10.0.0.0/8"]);
    h.scheduler.run_once().await.expect("initial sync");
    assert_eq!(h.device.peer_count(WG).await, 2);
    let calls_before = h.device.configure_calls();

    h.directory.revoke("yara").expect("revoke");
    h.firewall.clear_calls();
    let report = h.scheduler.run_once().await.expect("cycle");

    assert_eq!(report.removed, 1);
    assert_eq!(report.added, 0);
    assert_eq!(h.device.configure_calls(), calls_before + 1);
    assert!(h.device.peer(WG, &key(1)).await.is_none());
    assert!(h.device.peer(WG, &key(2)).await.is_some());

    assert!(!h.firewall.has_chain("10.8.0.2"));
    assert_eq!(h.forward_jumps(), vec![jump("10.8.0.3")]);

    let ops: Vec<(&str, String)> = h
        .firewall
        .calls()
        .into_iter()
        .map(|c| (c.op, c.chain))
        .collect();
    assert_eq!(
        ops,
        vec![
            ("list_chains", "filter".to_string()),
            ("clear_chain", "10.8.0.2".to_string()),
            ("delete", FORWARD_CHAIN.to_string()),
            ("delete_chain", "10.8.0.2".to_string()),
        ]
    );
}

#[tokio::test]
async fn freed_address_is_reused_in_same_cycle() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "alice", &["10.0.0.0/8"]);
    h.provision(2, "bob", &["10.0.0.0/8"]);
    h.scheduler.run_once().await.expect("initial sync");

    h.directory.revoke("bob").expect("revoke");
    let carol = h.provision(3, "carol", &["10.2.0.0/16->22/tcp"]);
    assert_eq!(carol.client_address, Ipv4Addr::new(10, 8, 0, 3));

    let report = h.scheduler.run_once().await.expect("cycle");
    assert_eq!(report.removed, 1);
    assert_eq!(report.added, 1);
    assert!(report.failed.is_empty());

    assert!(h.device.peer(WG, &key(2)).await.is_none());
    let peer = h.device.peer(WG, &key(3)).await.expect("carol on device");
    assert_eq!(peer.allowed_ips, vec![AllowedIp::host_v4(carol.client_address)]);

    assert_eq!(effective_routes(&h.chain_rules("10.8.0.3")), carol.routes);
    let jumps = h.forward_jumps();
    assert_eq!(jumps.len(), 2);
    assert!(jumps.contains(&jump("10.8.0.2")));
    assert!(jumps.contains(&jump("10.8.0.3")));
}

#[tokio::test]
async fn route_change_rebuilds_chain_without_touching_device() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "zed", &["10.0.0.0/8->22/tcp"]);
    h.scheduler.run_once().await.expect("initial sync");
    let peer_before = h.device.peer(WG, &key(1)).await.expect("peer");
    let calls_before = h.device.configure_calls();

    let new_routes = vec![
        "10.1.0.0/16->443/tcp".parse::<RouteRule>().expect("route"),
        "192.168.5.0/24".parse::<RouteRule>().expect("route"),
    ];
    let updated = h
        .directory
        .update_routes("zed", new_routes.clone())
        .expect("profile exists");
    assert_eq!(updated.serial, 1);

    let report = h.scheduler.run_once().await.expect("cycle");
    assert_eq!(report.routes_updated, 1);
    assert_eq!(report.added, 0);
    assert_eq!(report.removed, 0);

    assert_eq!(h.device.configure_calls(), calls_before);
    assert_eq!(h.device.peer(WG, &key(1)).await, Some(peer_before));
    assert_eq!(effective_routes(&h.chain_rules("10.8.0.2")), new_routes);
    assert_eq!(h.forward_jumps(), vec![jump("10.8.0.2")]);
}

#[tokio::test]
async fn converged_gateway_is_left_alone() {
    let mut h = Harness::new(&SyncConfig {
        allow_full_internet: true,
        ..SyncConfig::default()
    })
    .await;
    h.provision(1, "alice", &["10.0.0.0/8->22/tcp"]);
    h.provision(2, "bob", &[]);
    h.scheduler.run_once().await.expect("initial sync");

    let calls_before = h.device.configure_calls();
    h.firewall.clear_calls();

    let report = h.scheduler.run_once().await.expect("steady state");
    assert!(report.is_noop());
    assert_eq!(h.firewall.call_count(), 0);
    assert_eq!(h.device.configure_calls(), calls_before);
}

#[tokio::test]
async fn empty_directory_removes_every_peer() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "alice", &["10.0.0.0/8"]);
    h.provision(2, "bob", &["10.0.0.0/8"]);
    h.scheduler.run_once().await.expect("initial sync");

    h.directory.revoke("alice").expect("revoke");
    h.directory.revoke("bob").expect("revoke");
    let report = h.scheduler.run_once().await.expect("cycle");

    assert_eq!(report.removed, 2);
    assert_eq!(h.device.peer_count(WG).await, 0);
    assert!(h.firewall.user_chains().is_empty());
    assert!(h.forward_jumps().is_empty());
    assert!(h.scheduler.state().is_empty());
}

#[tokio::test]
async fn empty_directory_and_device_make_no_calls() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    let report = h.scheduler.run_once().await.expect("cycle");
    assert!(report.is_noop());
    assert_eq!(h.firewall.call_count(), 0);
    assert_eq!(h.device.configure_calls(), 0);
}

#[tokio::test]
async fn failing_peer_does_not_block_others() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "alice", &["10.0.0.0/8"]);
    h.provision(2, "bob", &["10.0.0.0/8"]);
    h.provision(3, "carol", &["10.0.0.0/8"]);
    h.firewall.fail_chain("10.8.0.3");

    let report = h.scheduler.run_once().await.expect("cycle");
    assert_eq!(report.added, 2);
    assert!(report.failed.contains(&key(2)));
    assert!(h.device.peer(WG, &key(1)).await.is_some());
    assert!(h.device.peer(WG, &key(2)).await.is_none());
    assert!(h.device.peer(WG, &key(3)).await.is_some());
    assert!(h.scheduler.state().get(&key(2)).is_none());

    h.firewall.heal("10.8.0.3");
    let report = h.scheduler.run_once().await.expect("retry");
    assert_eq!(report.added, 1);
    assert!(report.failed.is_empty());
    assert!(h.device.peer(WG, &key(2)).await.is_some());
    assert!(h.firewall.has_chain("10.8.0.3"));
}

#[tokio::test]
async fn failed_route_update_is_retried() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "alice", &["10.0.0.0/8"]);
    h.scheduler.run_once().await.expect("initial sync");

    h.directory
        .update_routes("alice", vec!["10.2.0.0/16".parse().expect("route")])
        .expect("profile exists");
    h.firewall.fail_chain("10.8.0.2");
    let report = h.scheduler.run_once().await.expect("cycle");
    assert!(report.failed.contains(&key(1)));
    assert_eq!(h.scheduler.state().get(&key(1)).map(|r| r.serial), Some(0));

    h.firewall.heal("10.8.0.2");
    let report = h.scheduler.run_once().await.expect("retry");
    assert_eq!(report.routes_updated, 1);
    assert_eq!(h.scheduler.state().get(&key(1)).map(|r| r.serial), Some(1));
    assert_eq!(
        effective_routes(&h.chain_rules("10.8.0.2")),
        vec!["10.2.0.0/16".parse::<RouteRule>().expect("route")]
    );
}

#[tokio::test]
async fn unreadable_directory_changes_nothing() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.provision(1, "alice", &[]);
    h.directory.set_fail_reads(true);

    let err = h.scheduler.run_once().await.expect_err("directory down");
    assert!(matches!(err, SyncError::DirectoryUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(h.firewall.call_count(), 0);
    assert_eq!(h.device.configure_calls(), 0);

    h.directory.set_fail_reads(false);
    let report = h.scheduler.run_once().await.expect("recovered");
    assert_eq!(report.added, 1);
}

#[tokio::test]
async fn inconsistent_directory_aborts_cycle() {
    let mut h = Harness::new(&SyncConfig::default()).await;
    h.directory
        .insert(PeerRecord::new(key(1), "alice", psk(1), POOL_START));
    h.directory
        .insert(PeerRecord::new(key(2), "mallory", psk(2), POOL_START));

    let err = h.scheduler.run_once().await.expect_err("duplicate address");
    assert!(matches!(err, SyncError::DirectoryInconsistent(_)));
    assert_eq!(h.firewall.call_count(), 0);
    assert_eq!(h.device.peer_count(WG).await, 0);
}

#[tokio::test]
async fn restart_rebuilds_chains_for_existing_peers() {
    let config = SyncConfig::default();
    let directory = MemoryDirectory::new(POOL_START);
    let device = FakeWireGuardDevice::with_device(WG).await;
    let firewall = Arc::new(MemoryFirewall::new());

    let record = directory
        .provision(key(1), "alice", psk(1), vec!["10.0.0.0/8".parse().expect("route")], false)
        .expect("provision");
    device
        .insert_peer(
            WG,
            PeerConfig::new(key(1))
                .with_preshared_key(psk(1))
                .with_allowed_ip(AllowedIp::host_v4(record.client_address)),
        )
        .await
        .expect("seed device");

    let mut h = Harness::with_parts(directory, device, firewall, &config);
    let report = h.scheduler.run_once().await.expect("cycle");

    assert_eq!(report.routes_updated, 1);
    assert_eq!(h.device.configure_calls(), 0);
    assert_eq!(h.forward_jumps(), vec![jump("10.8.0.2")]);
}

#[tokio::test]
async fn default_routes_apply_to_full_tunnel_peers() {
    let config = SyncConfig {
        default_routes: vec!["192.168.10.0/24".parse().expect("route")],
        ..SyncConfig::default()
    };
    let mut h = Harness::new(&config).await;
    h.provision(1, "alice", &[]);
    h.scheduler.run_once().await.expect("cycle");

    assert_eq!(effective_routes(&h.chain_rules("10.8.0.2")), config.default_routes);
}
