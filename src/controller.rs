//! # Role Controllers
//!
//! A [`DhtController`] runs one DHT session in one role: it binds the
//! endpoint, restores persisted state, bootstraps, reacts to host events and
//! persists again on stop.
//!
//! | | Active | Passive |
//! |---|---|---|
//! | identity | reused from the snapshot | fresh per session |
//! | contact | routable | firewalled |
//! | persisted | routing table and database | most recently seen contacts |
//! | `get_active_dht_nodes` | local contact plus most recently seen | pinned leaves, else most recently seen |
//! | leaf events | ignored | pin / unpin the leaf |
//!
//! Starting requires the host to be connected and DHT-capable unless
//! `force_connect` is set; otherwise `start` does nothing.
//!
//! ## Node Adder
//!
//! Addresses offered after bootstrap go to a bounded newest-first set that a
//! background task drains every `node_adder_interval`, pinging each address
//! so responders enter the routing table.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::bootstrap::{AddressSet, BootstrapPhase, Bootstrapper};
use crate::config::DhtConfig;
use crate::dht::{DhtNode, NodeSnapshot};
use crate::host::{ConnectionEvent, DhtEvent, DhtMode, HostOverlay, ResourceOracle};
use crate::identity::{Contact, Identity};
use crate::persistence::{self, ActiveSnapshot};
use crate::protocols::{DhtNodeRpc, NetworkBinder};

struct Session<B: NetworkBinder> {
    node: DhtNode<B::Rpc>,
    bootstrapper: Bootstrapper,
    node_adder: Arc<Mutex<AddressSet>>,
}

pub struct DhtController<B: NetworkBinder> {
    mode: DhtMode,
    config: DhtConfig,
    host: Arc<dyn HostOverlay>,
    oracle: Arc<dyn ResourceOracle>,
    binder: B,
    events: broadcast::Sender<DhtEvent>,
    session: Option<Session<B>>,
}

impl<B: NetworkBinder> DhtController<B> {
    pub fn new(
        mode: DhtMode,
        config: DhtConfig,
        host: Arc<dyn HostOverlay>,
        oracle: Arc<dyn ResourceOracle>,
        binder: B,
        events: broadcast::Sender<DhtEvent>,
    ) -> Self {
        Self {
            mode,
            config,
            host,
            oracle,
            binder,
            events,
            session: None,
        }
    }

    pub fn mode(&self) -> DhtMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// The running node, if any.
    pub fn node(&self) -> Option<&DhtNode<B::Rpc>> {
        self.session.as_ref().map(|s| &s.node)
    }

    pub async fn phase(&self) -> BootstrapPhase {
        match &self.session {
            Some(session) => session.bootstrapper.phase().await,
            None => BootstrapPhase::Idle,
        }
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.phase().await.is_bootstrapped()
    }

    pub async fn is_waiting_for_nodes(&self) -> bool {
        self.phase().await.is_waiting()
    }

    fn preconditions_met(&self) -> bool {
        let force = self.config.force_connect;
        (force || self.host.is_connected()) && (force || self.host.is_dht_capable())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the session. Returns whether a session is running afterwards.
    pub async fn start(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }
        if !self.preconditions_met() {
            debug!(mode = %self.mode, "start skipped: host not connected or not DHT-capable");
            return false;
        }

        let (identity, snapshot, seeds) = self.load_state().await;
        let firewalled = self.mode == DhtMode::Passive;
        let external = self.host.external_addr();
        let bound = self.binder.bind(self.config.bind_addr, identity, firewalled, external).await;
        let (network, incoming) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                warn!(mode = %self.mode, addr = %self.config.bind_addr, error = %e, "failed to bind DHT endpoint");
                return false;
            }
        };

        let node = DhtNode::new(network, self.config.clone(), self.mode, self.oracle.clone());
        node.serve(incoming);
        if !snapshot.contacts.is_empty() || !snapshot.values.is_empty() {
            node.restore(snapshot).await;
        }

        let bootstrapper = Bootstrapper::new(node.clone(), self.host.clone(), self.events.clone(), seeds);
        let node_adder = Arc::new(Mutex::new(AddressSet::new(self.config.node_adder_capacity)));
        spawn_node_adder(node.clone(), node_adder.clone());

        info!(
            mode = %self.mode,
            id = %node.identity().short(),
            addr = %node.contact().addr,
            "DHT starting"
        );
        let _ = self.events.send(DhtEvent::Starting { mode: self.mode });
        bootstrapper.start().await;

        self.session = Some(Session {
            node,
            bootstrapper,
            node_adder,
        });
        true
    }

    /// Identity, state to restore and bootstrap seeds for a new session.
    async fn load_state(&self) -> (Identity, NodeSnapshot, Vec<Contact>) {
        let Some(dir) = self.config.persist_dir.as_deref() else {
            return (Identity::random(), NodeSnapshot::default(), Vec::new());
        };

        match self.mode {
            DhtMode::Active => match persistence::load_active(dir, self.config.snapshot_version).await {
                Some(saved) => {
                    let seeds = saved.contacts.clone();
                    let snapshot = NodeSnapshot {
                        contacts: saved.contacts,
                        values: saved.values,
                    };
                    (saved.local_id, snapshot, seeds)
                }
                None => (Identity::random(), NodeSnapshot::default(), Vec::new()),
            },
            DhtMode::Passive => {
                let contacts = persistence::load_passive(dir, self.config.max_persisted_nodes).await;
                let snapshot = NodeSnapshot {
                    contacts: contacts.clone(),
                    values: Vec::new(),
                };
                (Identity::random(), snapshot, contacts)
            }
        }
    }

    /// Persist, close the node and withdraw the capability announcement.
    /// Stopping a stopped controller does nothing.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.bootstrapper.stop().await;
        session.node_adder.lock().await.clear();
        self.persist(&session.node).await;
        session.node.close().await;
        self.host.send_capabilities(None).await;

        info!(mode = %self.mode, id = %session.node.identity().short(), "DHT stopped");
        let _ = self.events.send(DhtEvent::Stopped { mode: self.mode });
    }

    async fn persist(&self, node: &DhtNode<B::Rpc>) {
        let Some(dir) = self.config.persist_dir.as_deref() else {
            return;
        };

        let result = match self.mode {
            DhtMode::Active => {
                let NodeSnapshot { contacts, values } = node.snapshot().await;
                let snapshot = ActiveSnapshot {
                    version: self.config.snapshot_version,
                    local_id: node.identity(),
                    contacts,
                    values,
                };
                persistence::save_active(dir, &snapshot).await
            }
            DhtMode::Passive => {
                let contacts = node.mrs_contacts(self.config.max_persisted_nodes).await;
                persistence::save_passive(
                    dir,
                    &contacts,
                    self.config.max_persisted_nodes,
                    self.config.min_persisted_nodes,
                )
                .await
            }
        };
        if let Err(e) = result {
            warn!(mode = %self.mode, error = %e, "failed to persist DHT state");
        }
    }

    // ========================================================================
    // Host input
    // ========================================================================

    /// A DHT host learned from the overlay: a bootstrap hint before
    /// bootstrap, a node-adder candidate after.
    pub async fn add_active_dht_node(&self, addr: SocketAddr) {
        let Some(session) = &self.session else {
            return;
        };
        if session.bootstrapper.phase().await.is_bootstrapped() {
            session.node_adder.lock().await.push(addr);
        } else {
            session.bootstrapper.add_hint(addr).await;
        }
    }

    /// A passive host learned from the overlay. Only used while waiting for
    /// bootstrap hosts.
    pub async fn add_passive_dht_node(&self, addr: SocketAddr) {
        let Some(session) = &self.session else {
            return;
        };
        if session.bootstrapper.phase().await.is_waiting() {
            session.bootstrapper.add_hint(addr).await;
        }
    }

    /// Contacts to advertise to overlay peers as DHT entry points.
    pub async fn get_active_dht_nodes(&self, max: usize) -> Vec<Contact> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        if max == 0 {
            return Vec::new();
        }

        match self.mode {
            DhtMode::Active => {
                if !session.bootstrapper.phase().await.is_bootstrapped() {
                    return Vec::new();
                }
                let mut nodes = vec![session.node.contact()];
                nodes.extend(session.node.mrs_contacts(max - 1).await);
                nodes
            }
            DhtMode::Passive => {
                let mut leaves = session.node.pinned_leaves().await;
                if leaves.is_empty() {
                    session.node.mrs_contacts(max).await
                } else {
                    leaves.truncate(max);
                    leaves
                }
            }
        }
    }

    /// Leaf lifecycle events. Connectivity events are handled by the manager.
    pub async fn handle_connection_event(&self, event: &ConnectionEvent) {
        let Some(session) = &self.session else {
            return;
        };
        if self.mode != DhtMode::Passive {
            return;
        }

        match event {
            ConnectionEvent::LeafDhtCapable { addr } => match session.node.add_pinned_leaf(*addr).await {
                Ok(contact) => debug!(%addr, id = %contact.identity.short(), "pinned DHT-capable leaf"),
                Err(e) => debug!(%addr, error = %e, "could not pin leaf"),
            },
            ConnectionEvent::LeafClosed { addr } => {
                if session.node.remove_pinned_leaf(*addr).await.is_some() {
                    debug!(%addr, "unpinned closed leaf");
                }
            }
            ConnectionEvent::Connected | ConnectionEvent::Disconnected | ConnectionEvent::AddressChanged => {}
        }
    }
}

fn spawn_node_adder<N: DhtNodeRpc>(node: DhtNode<N>, pending: Arc<Mutex<AddressSet>>) {
    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(node.config().node_adder_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let addrs = pending.lock().await.drain();
            for addr in addrs {
                debug!(%addr, "node adder pinging");
                if let Err(e) = node.ping(addr).await {
                    debug!(%addr, error = %e, "node adder ping failed");
                }
            }
        }
    });
}
