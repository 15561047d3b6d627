//! # DHT Manager
//!
//! The application-facing entry point. [`DhtManager`] owns at most one
//! [`DhtController`] and funnels every lifecycle operation through a single
//! command queue, so start, stop, mode switches and host events are applied
//! strictly one after another.
//!
//! ## Mode Switching
//!
//! | Current | `start(mode)` |
//! |---------|---------------|
//! | none | create a controller for `mode` and start it |
//! | same mode | start it if it is not running |
//! | other mode | stop (and persist) the current one, then start `mode` |
//!
//! ## Host Events
//!
//! | Event | Effect |
//! |-------|--------|
//! | `Disconnected` | stop the controller unless `force_connect` |
//! | `AddressChanged` | restart a running controller |
//! | leaf events | forwarded to the controller |
//!
//! `get` and `put` return `None` unless a bootstrapped node is available.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::controller::DhtController;
use crate::dht::{DhtNode, NodeStats, StoreSummary};
use crate::host::{ConnectionEvent, DhtEvent, DhtMode, HostOverlay, ResourceOracle};
use crate::identity::{Contact, Key};
use crate::messages::DhtValue;
use crate::protocols::NetworkBinder;
use crate::task::DhtFuture;

const MANAGER_COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Running state as seen by the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DhtStatus {
    pub mode: Option<DhtMode>,
    pub running: bool,
    pub bootstrapped: bool,
    pub waiting_for_nodes: bool,
    pub local: Option<Contact>,
    pub stats: NodeStats,
}

enum Command {
    Start(DhtMode),
    Stop(oneshot::Sender<()>),
    AddActiveNode(SocketAddr),
    AddPassiveNode(SocketAddr),
    ActiveNodes(usize, oneshot::Sender<Vec<Contact>>),
    Status(oneshot::Sender<DhtStatus>),
    ConnectionEvent(ConnectionEvent),
    Get(Key, oneshot::Sender<Option<DhtFuture<Vec<DhtValue>>>>),
    Put(DhtValue, oneshot::Sender<Option<DhtFuture<StoreSummary>>>),
    Quit(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct DhtManager {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<DhtEvent>,
    stop_timeout: tokio::time::Duration,
}

struct DhtManagerActor<B: NetworkBinder + Clone> {
    config: DhtConfig,
    host: Arc<dyn HostOverlay>,
    oracle: Arc<dyn ResourceOracle>,
    binder: B,
    events: broadcast::Sender<DhtEvent>,
    controller: Option<DhtController<B>>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtManager {
    pub fn new<B: NetworkBinder + Clone>(
        config: DhtConfig,
        host: Arc<dyn HostOverlay>,
        oracle: Arc<dyn ResourceOracle>,
        binder: B,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(MANAGER_COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let stop_timeout = config.stop_timeout;

        let actor = DhtManagerActor {
            config,
            host,
            oracle,
            binder,
            events: events.clone(),
            controller: None,
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            events,
            stop_timeout,
        }
    }

    /// Start in active or passive mode, switching modes if necessary.
    /// Does nothing while the host is not connected or not DHT-capable.
    pub async fn start(&self, active_mode: bool) {
        let mode = if active_mode { DhtMode::Active } else { DhtMode::Passive };
        let _ = self.cmd_tx.send(Command::Start(mode)).await;
    }

    /// Stop and persist the running node, waiting at most `stop_timeout`.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_err() {
            return;
        }
        if tokio::time::timeout(self.stop_timeout, rx).await.is_err() {
            warn!(timeout = ?self.stop_timeout, "DHT stop did not finish in time");
        }
    }

    pub async fn add_active_dht_node(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(Command::AddActiveNode(addr)).await;
    }

    pub async fn add_passive_dht_node(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(Command::AddPassiveNode(addr)).await;
    }

    pub async fn get_active_dht_nodes(&self, max: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ActiveNodes(max, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> DhtStatus {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Status(tx)).await.is_err() {
            return DhtStatus::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.status().await.running
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.status().await.bootstrapped
    }

    pub async fn is_waiting_for_nodes(&self) -> bool {
        self.status().await.waiting_for_nodes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    pub async fn handle_connection_event(&self, event: ConnectionEvent) {
        let _ = self.cmd_tx.send(Command::ConnectionEvent(event)).await;
    }

    /// Look up every value stored under `key`. `None` unless bootstrapped.
    pub async fn get(&self, key: Key) -> Option<DhtFuture<Vec<DhtValue>>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Get(key, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Store and publish `value`. `None` unless bootstrapped.
    pub async fn put(&self, value: DhtValue) -> Option<DhtFuture<StoreSummary>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Put(value, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Stop the running node and the manager itself.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit(tx)).await.is_err() {
            return;
        }
        let _ = tokio::time::timeout(self.stop_timeout, rx).await;
    }
}

impl<B: NetworkBinder + Clone> DhtManagerActor<B> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Start(mode) => self.switch_mode(mode).await,
                Command::Stop(reply) => {
                    self.stop_controller().await;
                    let _ = reply.send(());
                }
                Command::AddActiveNode(addr) => {
                    if let Some(controller) = &self.controller {
                        controller.add_active_dht_node(addr).await;
                    }
                }
                Command::AddPassiveNode(addr) => {
                    if let Some(controller) = &self.controller {
                        controller.add_passive_dht_node(addr).await;
                    }
                }
                Command::ActiveNodes(max, reply) => {
                    let nodes = match &self.controller {
                        Some(controller) => controller.get_active_dht_nodes(max).await,
                        None => Vec::new(),
                    };
                    let _ = reply.send(nodes);
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.status().await);
                }
                Command::ConnectionEvent(event) => self.handle_connection_event(event).await,
                Command::Get(key, reply) => {
                    let future = self.bootstrapped_node().await.map(|node| node.get(key, None));
                    let _ = reply.send(future);
                }
                Command::Put(value, reply) => {
                    let future = self.bootstrapped_node().await.map(|node| node.put(value));
                    let _ = reply.send(future);
                }
                Command::Quit(reply) => {
                    self.stop_controller().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("DHT manager finished");
    }

    async fn switch_mode(&mut self, mode: DhtMode) {
        if let Some(controller) = &mut self.controller
            && controller.mode() == mode
        {
            controller.start().await;
            return;
        }

        if let Some(mut previous) = self.controller.take() {
            info!(from = %previous.mode(), to = %mode, "switching DHT mode");
            previous.stop().await;
        }

        let mut controller = DhtController::new(
            mode,
            self.config.clone(),
            self.host.clone(),
            self.oracle.clone(),
            self.binder.clone(),
            self.events.clone(),
        );
        controller.start().await;
        self.controller = Some(controller);
    }

    async fn stop_controller(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.stop().await;
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected => {
                if self.config.force_connect {
                    return;
                }
                if self.controller.as_ref().is_some_and(|c| c.is_running()) {
                    debug!("host disconnected, stopping DHT");
                    self.stop_controller().await;
                }
            }
            ConnectionEvent::AddressChanged => {
                if let Some(controller) = &mut self.controller
                    && controller.is_running()
                {
                    debug!("external address changed, restarting DHT");
                    controller.stop().await;
                    controller.start().await;
                }
            }
            ConnectionEvent::Connected => {}
            ConnectionEvent::LeafDhtCapable { .. } | ConnectionEvent::LeafClosed { .. } => {
                if let Some(controller) = &self.controller {
                    controller.handle_connection_event(&event).await;
                }
            }
        }
    }

    async fn bootstrapped_node(&self) -> Option<&DhtNode<B::Rpc>> {
        let controller = self.controller.as_ref()?;
        if !controller.is_bootstrapped().await {
            return None;
        }
        controller.node()
    }

    async fn status(&self) -> DhtStatus {
        let Some(controller) = &self.controller else {
            return DhtStatus::default();
        };
        let phase = controller.phase().await;
        let (local, stats) = match controller.node() {
            Some(node) => (Some(node.contact()), node.stats().await),
            None => (None, NodeStats::default()),
        };
        DhtStatus {
            mode: Some(controller.mode()),
            running: controller.is_running(),
            bootstrapped: phase.is_bootstrapped(),
            waiting_for_nodes: phase.is_waiting(),
            local,
            stats,
        }
    }
}
