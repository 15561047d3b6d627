//! Integration tests for the public DhtManager API over loopback UDP.
//!
//! Every manager binds `127.0.0.1:0`, so tests never fight over ports and
//! can run in parallel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kadmesh::{
    ConnectionEvent, DhtConfig, DhtEvent, DhtManager, DhtMode, DhtValue, Key, StaticHost, StaticOracle, UdpBinder,
    ValueType,
};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Short timers so lookups against dead peers finish quickly.
fn test_config() -> DhtConfig {
    DhtConfig {
        bind_addr: loopback(),
        force_connect: true,
        rpc_timeout: Duration::from_millis(500),
        lookup_timeout: Duration::from_secs(5),
        boost_frequency: Duration::from_millis(200),
        boost_timeout: Duration::from_millis(500),
        stop_timeout: Duration::from_secs(5),
        ..DhtConfig::default()
    }
}

fn manager(config: DhtConfig) -> (DhtManager, Arc<StaticHost>) {
    let host = Arc::new(StaticHost::default());
    let dht = DhtManager::new(config, host.clone(), Arc::new(StaticOracle::all_rare()), UdpBinder);
    (dht, host)
}

async fn wait_bootstrapped(dht: &DhtManager) {
    timeout(TEST_TIMEOUT, async {
        while !dht.is_bootstrapped().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("manager did not bootstrap in time");
}

async fn running_seed() -> (DhtManager, SocketAddr) {
    let (seed, _) = manager(test_config());
    seed.start(true).await;
    let addr = seed.status().await.local.expect("seed should be running").addr;
    (seed, addr)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn lone_node_waits_for_bootstrap_hosts() {
    let (dht, host) = manager(test_config());
    let mut events = dht.subscribe();

    dht.start(true).await;
    let status = dht.status().await;
    assert!(status.running);
    assert_eq!(status.mode, Some(DhtMode::Active));
    assert!(!status.bootstrapped);

    let waiting = timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(DhtEvent::Waiting { mode }) => break mode,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("no waiting event");
    assert_eq!(waiting, DhtMode::Active);
    assert!(dht.is_waiting_for_nodes().await);
    assert!(host.announcements().is_empty());

    dht.quit().await;
}

#[tokio::test]
async fn bootstrap_through_hint_announces_capability() {
    let (_seed, seed_addr) = running_seed().await;
    let (dht, host) = manager(test_config());

    dht.start(true).await;
    dht.add_active_dht_node(seed_addr).await;
    wait_bootstrapped(&dht).await;

    assert_eq!(host.announcements(), vec![Some(DhtMode::Active)]);
    let nodes = dht.get_active_dht_nodes(10).await;
    let local = dht.status().await.local.unwrap();
    assert_eq!(nodes.first(), Some(&local));
    assert!(nodes.iter().any(|c| c.addr == seed_addr));

    dht.stop().await;
    assert_eq!(host.announcements().last(), Some(&None));
    assert!(dht.get_active_dht_nodes(10).await.is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_disconnect_respects_force() {
    let (dht, _) = manager(test_config());
    dht.start(true).await;

    dht.handle_connection_event(ConnectionEvent::Disconnected).await;
    assert!(dht.is_running().await, "force_connect keeps the node up");

    dht.stop().await;
    dht.stop().await;
    assert!(!dht.is_running().await);

    dht.start(true).await;
    assert!(dht.is_running().await);
    dht.quit().await;
}

// ============================================================================
// Values
// ============================================================================

#[tokio::test]
async fn value_put_on_one_node_is_found_from_another() {
    let (seed, seed_addr) = running_seed().await;
    let (writer, _) = manager(test_config());
    let (reader, _) = manager(test_config());
    for dht in [&writer, &reader] {
        dht.start(true).await;
        dht.add_active_dht_node(seed_addr).await;
        wait_bootstrapped(dht).await;
    }

    let key = Key::from_content(b"integration-song");
    let originator = writer.status().await.local.unwrap();
    let value = DhtValue::new(key, originator, ValueType::Text, b"la la la".to_vec());

    let summary = timeout(TEST_TIMEOUT, writer.put(value.clone()).await.expect("writer bootstrapped"))
        .await
        .expect("put timed out")
        .expect("put failed");
    assert!(summary.is_stored());

    let found = timeout(TEST_TIMEOUT, reader.get(key).await.expect("reader bootstrapped"))
        .await
        .expect("get timed out")
        .expect("get failed");
    assert_eq!(found, vec![value]);

    seed.quit().await;
    writer.quit().await;
    reader.quit().await;
}

#[tokio::test]
async fn passive_node_is_firewalled_and_can_read() {
    let (seed, seed_addr) = running_seed().await;
    let (writer, _) = manager(test_config());
    writer.start(true).await;
    writer.add_active_dht_node(seed_addr).await;
    wait_bootstrapped(&writer).await;

    let key = Key::from_content(b"passive-read");
    let originator = writer.status().await.local.unwrap();
    let value = DhtValue::new(key, originator, ValueType::Binary, vec![1, 2, 3]);
    writer.put(value.clone()).await.unwrap().await.unwrap();

    let (leaf, host) = manager(test_config());
    leaf.start(false).await;
    let status = leaf.status().await;
    assert_eq!(status.mode, Some(DhtMode::Passive));
    assert!(status.local.unwrap().firewalled);

    leaf.add_passive_dht_node(seed_addr).await;
    wait_bootstrapped(&leaf).await;
    assert_eq!(host.announcements(), vec![Some(DhtMode::Passive)]);

    let found = timeout(TEST_TIMEOUT, leaf.get(key).await.unwrap()).await.unwrap().unwrap();
    assert_eq!(found, vec![value]);

    seed.quit().await;
    writer.quit().await;
    leaf.quit().await;
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn active_restart_keeps_identity_and_rejoins() {
    let dir = tempfile::tempdir().unwrap();
    let (_seed, seed_addr) = running_seed().await;
    let config = DhtConfig {
        persist_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };

    let (first, _) = manager(config.clone());
    first.start(true).await;
    first.add_active_dht_node(seed_addr).await;
    wait_bootstrapped(&first).await;
    let before = first.status().await.local.unwrap();
    first.quit().await;

    let (second, _) = manager(config);
    second.start(true).await;
    let after = second.status().await.local.unwrap();
    assert_eq!(after.identity, before.identity);

    // The persisted routing table is enough to rejoin without hints.
    wait_bootstrapped(&second).await;
    assert!(second.status().await.stats.contacts >= 1);
    second.quit().await;
}

#[tokio::test]
async fn mode_switch_starts_fresh_identity() {
    let (dht, _) = manager(test_config());
    dht.start(true).await;
    let active = dht.status().await.local.unwrap();

    dht.start(false).await;
    let passive = dht.status().await.local.unwrap();
    assert_ne!(active.identity, passive.identity);
    assert!(passive.firewalled);
    assert_eq!(dht.status().await.mode, Some(DhtMode::Passive));

    dht.quit().await;
    assert!(!dht.is_running().await);
}
