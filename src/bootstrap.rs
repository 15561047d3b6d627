//! # Bootstrapping
//!
//! Gets a freshly started node into the overlay.
//!
//! ## Sources
//!
//! Tried in order, falling through when one is exhausted:
//!
//! | Source | Attempt | Success |
//! |--------|---------|---------|
//! | live hints | ping the most recently received address | the ping answers |
//! | persisted table | lookup for the local id over the restored contacts | any contact responds |
//! | fallback hosts | ping the host whose region matches the local id | the ping answers |
//!
//! With every source exhausted the bootstrapper waits; the next hint starts
//! it again.
//!
//! ## Pre-emption
//!
//! A live hint arriving while the persisted table or a fallback host is
//! being tried cancels that attempt and starts over from the hint. Each
//! attempt carries a generation number so a cancelled attempt that still
//! reports back is ignored.
//!
//! ## Success
//!
//! On success the node announces its role to the host overlay and a
//! [`DhtEvent::Connected`] is broadcast. A ping success additionally starts a
//! lookup for the local id through the answering contact to populate the
//! table.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::dht::DhtNode;
use crate::error::DhtError;
use crate::host::{DhtEvent, HostOverlay};
use crate::identity::{Contact, Identity};
use crate::lookup::LookupOutcome;
use crate::protocols::DhtNodeRpc;
use crate::task::DhtFuture;

const BOOTSTRAP_COMMAND_CHANNEL_SIZE: usize = 64;

// ============================================================================
// Bounded address sets
// ============================================================================

/// Bounded set of addresses handed out newest first.
///
/// Re-adding a known address makes it the newest again; at capacity the
/// oldest address is dropped.
#[derive(Debug)]
pub struct AddressSet {
    entries: LruCache<SocketAddr, ()>,
}

impl AddressSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn push(&mut self, addr: SocketAddr) {
        self.entries.put(addr, ());
    }

    /// Remove and return the newest address.
    pub fn pop_newest(&mut self) -> Option<SocketAddr> {
        let newest = self.entries.iter().next().map(|(addr, _)| *addr)?;
        self.entries.pop(&newest);
        Some(newest)
    }

    /// Remove and return every address, newest first.
    pub fn drain(&mut self) -> Vec<SocketAddr> {
        let all: Vec<SocketAddr> = self.entries.iter().map(|(addr, _)| *addr).collect();
        self.entries.clear();
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fallback host responsible for the region of `local`.
///
/// The first four bits of the id split the key space into sixteen regions;
/// the host list is spread evenly over them.
pub fn fallback_index(local: &Identity, hosts: usize) -> Option<usize> {
    if hosts == 0 {
        return None;
    }
    let region = (local.as_bytes()[0] & 0xF0) >> 4;
    let index = (hosts as f64 / 16.0 * f64::from(region)) as usize;
    Some(index.min(hosts - 1))
}

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapSource {
    Hints,
    PersistedTable,
    FallbackHosts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    Idle,
    Bootstrapping(BootstrapSource),
    Bootstrapped,
    Waiting,
}

impl BootstrapPhase {
    pub fn is_bootstrapped(&self) -> bool {
        *self == BootstrapPhase::Bootstrapped
    }

    /// New hosts are wanted: every source is exhausted, or only the
    /// possibly stale persisted table is being tried.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            BootstrapPhase::Waiting | BootstrapPhase::Bootstrapping(BootstrapSource::PersistedTable)
        )
    }
}

enum Attempt {
    Ping(SocketAddr),
    Lookup(Vec<Contact>),
}

enum Command {
    Start,
    AddHint(SocketAddr),
    Finished {
        generation: u64,
        source: BootstrapSource,
        result: Result<usize, DhtError>,
    },
    Phase(oneshot::Sender<BootstrapPhase>),
    Stop(oneshot::Sender<()>),
}

/// Handle to the bootstrap state machine of one running node.
#[derive(Clone)]
pub struct Bootstrapper {
    cmd_tx: mpsc::Sender<Command>,
}

struct BootstrapActor<N: DhtNodeRpc> {
    node: DhtNode<N>,
    host: Arc<dyn HostOverlay>,
    events: broadcast::Sender<DhtEvent>,
    fallback_hosts: Vec<SocketAddr>,
    phase: BootstrapPhase,
    hints: AddressSet,
    persisted: Vec<Contact>,
    fallback_tried: bool,
    generation: u64,
    current: Option<CancellationToken>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Bootstrapper {
    /// Create the bootstrapper for `node`. `persisted` are contacts restored
    /// from a previous session; they are only used as lookup seeds.
    pub fn new<N: DhtNodeRpc>(
        node: DhtNode<N>,
        host: Arc<dyn HostOverlay>,
        events: broadcast::Sender<DhtEvent>,
        persisted: Vec<Contact>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(BOOTSTRAP_COMMAND_CHANNEL_SIZE);
        let actor = BootstrapActor {
            hints: AddressSet::new(node.config().bootstrap_hint_capacity),
            fallback_hosts: node.config().fallback_hosts.clone(),
            node,
            host,
            events,
            phase: BootstrapPhase::Idle,
            persisted,
            fallback_tried: false,
            generation: 0,
            current: None,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    pub async fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start).await;
    }

    /// Offer a live address to bootstrap from.
    pub async fn add_hint(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(Command::AddHint(addr)).await;
    }

    pub async fn phase(&self) -> BootstrapPhase {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Phase(tx)).await.is_err() {
            return BootstrapPhase::Idle;
        }
        rx.await.unwrap_or(BootstrapPhase::Idle)
    }

    /// Cancel any attempt in progress and stop the bootstrapper.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

impl<N: DhtNodeRpc> BootstrapActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Start => {
                    if self.phase == BootstrapPhase::Idle {
                        self.advance();
                    }
                }
                Command::AddHint(addr) => self.handle_hint(addr),
                Command::Finished {
                    generation,
                    source,
                    result,
                } => self.handle_finished(generation, source, result).await,
                Command::Phase(reply) => {
                    let _ = reply.send(self.phase);
                }
                Command::Stop(reply) => {
                    self.cancel_current();
                    self.hints.clear();
                    self.persisted.clear();
                    self.phase = BootstrapPhase::Idle;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        trace!("bootstrapper finished");
    }

    fn handle_hint(&mut self, addr: SocketAddr) {
        if addr == self.node.contact().addr || self.phase.is_bootstrapped() {
            return;
        }
        self.hints.push(addr);
        match self.phase {
            BootstrapPhase::Waiting => self.advance(),
            BootstrapPhase::Bootstrapping(BootstrapSource::PersistedTable | BootstrapSource::FallbackHosts) => {
                debug!(%addr, "live hint pre-empts bootstrap in progress");
                self.cancel_current();
                self.advance();
            }
            BootstrapPhase::Idle | BootstrapPhase::Bootstrapping(BootstrapSource::Hints) | BootstrapPhase::Bootstrapped => {}
        }
    }

    /// Start the next attempt, or wait when no source is left.
    fn advance(&mut self) {
        if let Some(addr) = self.hints.pop_newest() {
            self.launch(BootstrapSource::Hints, Attempt::Ping(addr));
            return;
        }

        if !self.persisted.is_empty() {
            let seeds = std::mem::take(&mut self.persisted);
            self.launch(BootstrapSource::PersistedTable, Attempt::Lookup(seeds));
            return;
        }

        if !self.fallback_tried {
            self.fallback_tried = true;
            let local = self.node.identity();
            if let Some(index) = fallback_index(&local, self.fallback_hosts.len()) {
                let addr = self.fallback_hosts[index];
                self.launch(BootstrapSource::FallbackHosts, Attempt::Ping(addr));
                return;
            }
        }

        if self.phase != BootstrapPhase::Waiting {
            info!(id = %self.node.identity().short(), "no bootstrap source left, waiting for hosts");
            self.phase = BootstrapPhase::Waiting;
            let _ = self.events.send(DhtEvent::Waiting { mode: self.node.mode() });
        }
    }

    fn launch(&mut self, source: BootstrapSource, attempt: Attempt) {
        self.generation += 1;
        let generation = self.generation;
        self.phase = BootstrapPhase::Bootstrapping(source);

        let node = self.node.clone();
        let parent = node.shutdown_token();
        let future = DhtFuture::spawn(Some(&parent), move |token| async move {
            match attempt {
                Attempt::Ping(addr) => {
                    trace!(%addr, "bootstrap ping");
                    let contact = node.ping(addr).await?;
                    // Populates the table; completion is not awaited.
                    let _ = node.bootstrap_from(vec![contact]);
                    Ok(1)
                }
                Attempt::Lookup(seeds) => {
                    trace!(seeds = seeds.len(), "bootstrap lookup");
                    match node.bootstrap_within(seeds, &token).await? {
                        LookupOutcome::Nodes { stats, .. } => Ok(stats.responses),
                        LookupOutcome::Values { stats, .. } => Ok(stats.responses),
                    }
                }
            }
        });

        self.current = Some(future.token());
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(Command::Finished { generation, source, result }).await;
        });
    }

    fn cancel_current(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
        self.generation += 1;
    }

    async fn handle_finished(&mut self, generation: u64, source: BootstrapSource, result: Result<usize, DhtError>) {
        if generation != self.generation {
            trace!(?source, "ignoring result of a superseded bootstrap attempt");
            return;
        }
        self.current = None;

        match result {
            Ok(responses) if responses > 0 => {
                let mode = self.node.mode();
                info!(id = %self.node.identity().short(), ?source, %mode, "bootstrapped");
                self.phase = BootstrapPhase::Bootstrapped;
                self.hints.clear();
                self.host.send_capabilities(Some(mode)).await;
                let _ = self.events.send(DhtEvent::Connected { mode });
            }
            Ok(_) => {
                debug!(?source, "bootstrap attempt reached nobody");
                self.advance();
            }
            Err(e) => {
                debug!(?source, error = %e, "bootstrap attempt failed");
                self.advance();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::host::{DhtMode, StaticHost, StaticOracle};
    use crate::protocols::NetworkBinder;
    use crate::routing::SelectMode;
    use crate::testutil::{NetworkRegistry, TestBinder, TestNetwork};
    use tokio::time::{Duration, sleep, timeout};

    async fn spawn_node(binder: &TestBinder, config: &DhtConfig) -> DhtNode<TestNetwork> {
        let (network, incoming) = binder
            .bind(SocketAddr::from(([0, 0, 0, 0], 0)), Identity::random(), false, None)
            .await
            .expect("bind");
        let node = DhtNode::new(network, config.clone(), DhtMode::Active, Arc::new(StaticOracle::all_rare()));
        node.serve(incoming);
        node
    }

    async fn wait_for_phase(bootstrapper: &Bootstrapper, wanted: BootstrapPhase) {
        timeout(Duration::from_secs(5), async {
            while bootstrapper.phase().await != wanted {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("phase reached");
    }

    #[test]
    fn address_set_is_lifo_and_bounded() {
        let mut set = AddressSet::new(3);
        let addrs: Vec<SocketAddr> = (1..=4).map(|n| format!("10.0.0.{n}:1").parse().unwrap()).collect();
        for addr in &addrs {
            set.push(*addr);
        }
        assert_eq!(set.len(), 3);
        set.push(addrs[1]);
        assert_eq!(set.pop_newest(), Some(addrs[1]));
        assert_eq!(set.drain(), vec![addrs[3], addrs[2]]);
        assert!(set.is_empty());
        assert_eq!(set.pop_newest(), None);
    }

    #[test]
    fn fallback_region_follows_leading_bits() {
        let mut bytes = [0u8; 20];
        assert_eq!(fallback_index(&Identity::from_bytes(bytes), 0), None);
        assert_eq!(fallback_index(&Identity::from_bytes(bytes), 32), Some(0));
        bytes[0] = 0xF3;
        assert_eq!(fallback_index(&Identity::from_bytes(bytes), 32), Some(30));
        assert_eq!(fallback_index(&Identity::from_bytes(bytes), 3), Some(2));
        bytes[0] = 0x80;
        assert_eq!(fallback_index(&Identity::from_bytes(bytes), 16), Some(8));
    }

    #[tokio::test]
    async fn hint_bootstraps_and_announces() {
        let config = DhtConfig::for_tests();
        let binder = TestBinder::new(NetworkRegistry::new());
        let seed = spawn_node(&binder, &config).await;
        let node = spawn_node(&binder, &config).await;
        let host = Arc::new(StaticHost::default());
        let (events, mut rx) = broadcast::channel(16);

        let bootstrapper = Bootstrapper::new(node.clone(), host.clone(), events, Vec::new());
        bootstrapper.add_hint(seed.contact().addr).await;
        bootstrapper.start().await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapped).await;

        assert_eq!(rx.recv().await.unwrap(), DhtEvent::Connected { mode: DhtMode::Active });
        assert_eq!(host.announcements(), vec![Some(DhtMode::Active)]);
        assert_eq!(node.select(seed.identity(), 1, SelectMode::Live).await[0].identity, seed.identity());
    }

    #[tokio::test]
    async fn exhausted_sources_wait_for_hints() {
        let config = DhtConfig {
            fallback_hosts: vec!["10.200.0.1:4000".parse().unwrap()],
            ..DhtConfig::for_tests()
        };
        let binder = TestBinder::new(NetworkRegistry::new());
        let node = spawn_node(&binder, &config).await;
        let seed = spawn_node(&binder, &config).await;
        let (events, mut rx) = broadcast::channel(16);

        let bootstrapper = Bootstrapper::new(node.clone(), Arc::new(StaticHost::default()), events, Vec::new());
        bootstrapper.add_hint("10.200.0.2:4000".parse().unwrap()).await;
        bootstrapper.start().await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Waiting).await;
        assert_eq!(rx.recv().await.unwrap(), DhtEvent::Waiting { mode: DhtMode::Active });

        bootstrapper.add_hint(seed.contact().addr).await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapped).await;
    }

    #[tokio::test]
    async fn live_hint_preempts_persisted_table() {
        let config = DhtConfig {
            rpc_timeout: Duration::from_millis(300),
            ..DhtConfig::for_tests()
        };
        let registry = NetworkRegistry::new();
        let binder = TestBinder::new(registry.clone());
        let node = spawn_node(&binder, &config).await;
        let stale = spawn_node(&binder, &config).await;
        let live = spawn_node(&binder, &config).await;
        registry.set_unreachable(stale.contact().addr, true).await;
        node.observe(stale.contact(), false).await;

        let (events, _rx) = broadcast::channel(16);
        let bootstrapper = Bootstrapper::new(node.clone(), Arc::new(StaticHost::default()), events, vec![stale.contact()]);
        bootstrapper.start().await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapping(BootstrapSource::PersistedTable)).await;

        bootstrapper.add_hint(live.contact().addr).await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapped).await;
        let known = node.select(live.identity(), 1, SelectMode::Live).await;
        assert_eq!(known[0].identity, live.identity());
    }

    #[tokio::test]
    async fn preempted_persisted_lookup_stops_querying() {
        let config = DhtConfig {
            rpc_timeout: Duration::from_secs(1),
            ..DhtConfig::for_tests()
        };
        let registry = NetworkRegistry::new();
        let binder = TestBinder::new(registry.clone());
        let node = spawn_node(&binder, &config).await;
        let persisted = spawn_node(&binder, &config).await;
        let behind = spawn_node(&binder, &config).await;
        let live = spawn_node(&binder, &config).await;
        persisted.observe(behind.contact(), true).await;
        registry.set_latency(persisted.contact().addr, Duration::from_millis(300)).await;

        let (events, _rx) = broadcast::channel(16);
        let bootstrapper =
            Bootstrapper::new(node.clone(), Arc::new(StaticHost::default()), events, vec![persisted.contact()]);
        bootstrapper.start().await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapping(BootstrapSource::PersistedTable)).await;
        sleep(Duration::from_millis(50)).await;
        assert!(registry.requests_to(&persisted.contact().addr).await >= 1);

        bootstrapper.add_hint(live.contact().addr).await;
        wait_for_phase(&bootstrapper, BootstrapPhase::Bootstrapped).await;
        sleep(Duration::from_millis(600)).await;

        assert_eq!(registry.requests_to(&behind.contact().addr).await, 0);
        let known = node.select(behind.identity(), 1, SelectMode::All).await;
        assert!(known.iter().all(|c| c.identity != behind.identity()));
    }

    #[tokio::test]
    async fn stop_cancels_and_resets() {
        let config = DhtConfig::for_tests();
        let registry = NetworkRegistry::new();
        let binder = TestBinder::new(registry.clone());
        let node = spawn_node(&binder, &config).await;
        let slow = spawn_node(&binder, &config).await;
        registry.set_latency(slow.contact().addr, Duration::from_secs(1)).await;

        let (events, _rx) = broadcast::channel(16);
        let bootstrapper = Bootstrapper::new(node, Arc::new(StaticHost::default()), events, Vec::new());
        bootstrapper.add_hint(slow.contact().addr).await;
        bootstrapper.start().await;
        bootstrapper.stop().await;
        bootstrapper.stop().await;
        assert_eq!(bootstrapper.phase().await, BootstrapPhase::Idle);
    }
}
