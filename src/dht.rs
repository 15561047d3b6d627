//! # DHT Node
//!
//! A running Kademlia participant: routing table, value database, request
//! handlers and the operations built on lookups (put, get, bootstrap).
//!
//! ## Architecture
//!
//! [`DhtNode`] is a cheap-to-clone handle. `DhtNodeActor` owns the
//! [`RoutingTable`] and the [`Database`] and applies every mutation from its
//! command queue, one at a time. Lookups, stores and pings run outside the
//! actor as tasks and report back through commands, so a slow peer never
//! stalls request handling.
//!
//! ```text
//!   inbound requests ──► serve task ──► actor ◄── lookup observer
//!                                        ▲
//!   put / get / bootstrap (tasks) ───────┘
//!   bucket refresh, republish (timers) ──┘
//! ```
//!
//! ## Background Tasks
//!
//! | Task | Period | Work |
//! |------|--------|------|
//! | bucket refresh | `bucket_refresh_interval` | lookup a random id in every idle bucket |
//! | republish | `republish_check_interval` | expire values, then republish what is due |
//!
//! Both stop when the node is closed.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::host::{DhtMode, ResourceOracle};
use crate::identity::{Contact, Identity, Key, now_ms};
use crate::lookup::{self, LookupKind, LookupObserver, LookupOutcome, LookupParams};
use crate::messages::{
    DhtRequest, DhtResponse, DhtValue, MAX_CONTACTS_PER_RESPONSE, StoreCode, StoreStatus, ValueType, batch_values,
    encoded_len,
};
use crate::protocols::{DhtNodeRpc, IncomingRequest};
use crate::routing::{AddOutcome, RoutingTable, SelectMode};
use crate::rpc::{self, send_with_resend};
use crate::storage::{Database, ValueEntity};
use crate::task::DhtFuture;

const NODE_COMMAND_CHANNEL_SIZE: usize = 256;

/// Result of publishing a value to the nodes closest to its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSummary {
    pub key: Key,
    /// Remote nodes that accepted the value.
    pub stored_at: Vec<Contact>,
    /// Remote nodes that answered with a rejection.
    pub rejected_by: Vec<Contact>,
    /// Remote nodes that timed out or answered malformed.
    pub failed: Vec<Contact>,
}

impl StoreSummary {
    fn new(key: Key) -> Self {
        Self {
            key,
            stored_at: Vec::new(),
            rejected_by: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_stored(&self) -> bool {
        !self.stored_at.is_empty()
    }
}

/// Routing table and database counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub contacts: usize,
    pub buckets: usize,
    pub pinned: usize,
    pub keys: usize,
    pub values: usize,
}

/// Everything a node persists between sessions.
#[derive(Clone, Debug, Default)]
pub struct NodeSnapshot {
    pub contacts: Vec<Contact>,
    pub values: Vec<ValueEntity>,
}

enum Command {
    // State updates
    Observe(Contact, bool),
    Failure(Identity),
    ApplyProbeResult(Contact, bool),
    MarkPublished(Key, Key),
    MarkRefreshed(Identity),
    Restore(NodeSnapshot),

    // Queries
    Select(Key, usize, SelectMode, oneshot::Sender<Vec<Contact>>),
    MrsContacts(usize, oneshot::Sender<Vec<Contact>>),
    GetLocal(Key, Option<ValueType>, oneshot::Sender<Vec<DhtValue>>),
    StoreLocal(DhtValue, oneshot::Sender<StoreCode>),
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Stats(oneshot::Sender<NodeStats>),
    StaleTargets(Duration, oneshot::Sender<Vec<Identity>>),
    CollectRepublish(oneshot::Sender<Vec<DhtValue>>),

    // Pinned leaves
    AddPinned(Contact, oneshot::Sender<AddOutcome>),
    RemovePinned(SocketAddr, oneshot::Sender<Option<Contact>>),
    PinnedLeaves(oneshot::Sender<Vec<Contact>>),

    // RPC handlers
    HandleRequest(IncomingRequest),

    Quit,
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: Contact,
    mode: DhtMode,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    shutdown: CancellationToken,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local.clone(),
            mode: self.mode,
            network: self.network.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RoutingTable,
    database: Database,
    config: Arc<DhtConfig>,
    mode: DhtMode,
    oracle: Arc<dyn ResourceOracle>,
    network: Arc<N>,
    local: Contact,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    /// Least-recently-seen contacts with a liveness probe in flight.
    probing: HashSet<Identity>,
}

/// Feeds lookup observations back into the actor.
struct NodeObserver {
    cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl LookupObserver for NodeObserver {
    async fn responded(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::Observe(contact, true)).await;
    }

    async fn learned(&self, contacts: Vec<Contact>) {
        for contact in contacts {
            if self.cmd_tx.send(Command::Observe(contact, false)).await.is_err() {
                return;
            }
        }
    }

    async fn failed(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::Failure(contact.identity)).await;
    }
}

impl<N: DhtNodeRpc> DhtNode<N> {
    /// Create a node on top of a bound transport and start its actor and
    /// background tasks.
    pub fn new(network: N, config: DhtConfig, mode: DhtMode, oracle: Arc<dyn ResourceOracle>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(NODE_COMMAND_CHANNEL_SIZE);
        let network = Arc::new(network);
        let local = network.local_contact();
        let config = Arc::new(config);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(
                local.identity,
                config.effective_k(),
                config.cache_size,
                config.max_consecutive_failures,
            ),
            database: Database::new(config.value_ttl, config.max_database_keys, config.max_values_per_key),
            config: config.clone(),
            mode,
            oracle,
            network: network.clone(),
            local: local.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            probing: HashSet::new(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            local,
            mode,
            network,
            config,
            shutdown: CancellationToken::new(),
        };
        node.spawn_periodic_bucket_refresh();
        node.spawn_periodic_republish();
        debug!(id = %node.local.identity.short(), addr = %node.local.addr, %mode, "DHT node started");
        node
    }

    pub fn identity(&self) -> Identity {
        self.local.identity
    }

    pub fn contact(&self) -> Contact {
        self.local.clone()
    }

    pub fn mode(&self) -> DhtMode {
        self.mode
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Token cancelled when the node closes; parent of every operation.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ========================================================================
    // Inbound requests
    // ========================================================================

    /// Answer requests arriving on `incoming` until the node closes.
    pub fn serve(&self, mut incoming: mpsc::Receiver<IncomingRequest>) {
        let cmd_tx = self.cmd_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = incoming.recv() => request,
                };
                let Some(request) = request else {
                    break;
                };
                if cmd_tx.send(Command::HandleRequest(request)).await.is_err() {
                    break;
                }
            }
            trace!("request loop finished");
        });
    }

    // ========================================================================
    // Routing table access
    // ========================================================================

    pub async fn observe(&self, contact: Contact, is_live: bool) {
        let _ = self.cmd_tx.send(Command::Observe(contact, is_live)).await;
    }

    pub async fn handle_failure(&self, id: Identity) {
        let _ = self.cmd_tx.send(Command::Failure(id)).await;
    }

    pub async fn select(&self, key: Key, count: usize, mode: SelectMode) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Select(key, count, mode, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Healthy contacts, most recently seen first.
    pub async fn mrs_contacts(&self, count: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::MrsContacts(count, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> NodeStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return NodeStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return NodeSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Load persisted contacts (as not yet verified) and values.
    pub async fn restore(&self, snapshot: NodeSnapshot) {
        let _ = self.cmd_tx.send(Command::Restore(snapshot)).await;
    }

    // ========================================================================
    // Pinned leaves
    // ========================================================================

    /// Probe `addr` and pin the responding contact.
    pub async fn add_pinned_leaf(&self, addr: SocketAddr) -> Result<Contact, DhtError> {
        let contact = self.ping(addr).await?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPinned(contact.clone(), tx))
            .await
            .map_err(|_| DhtError::Closed)?;
        match rx.await.map_err(|_| DhtError::Closed)? {
            AddOutcome::RejectedSelf => Err(DhtError::ProtocolViolation(format!("{addr} answered with the local id"))),
            AddOutcome::RejectedFull => Err(DhtError::ProtocolViolation(format!("no room to pin {addr}"))),
            _ => {
                debug!(%addr, id = %contact.identity.short(), "pinned leaf added");
                Ok(contact)
            }
        }
    }

    pub async fn remove_pinned_leaf(&self, addr: SocketAddr) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RemovePinned(addr, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn pinned_leaves(&self) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PinnedLeaves(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    // ========================================================================
    // Network operations
    // ========================================================================

    /// Liveness probe by address. A responding contact enters the table.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact, DhtError> {
        let contact = rpc::ping(&*self.network, addr, self.config.rpc_timeout, self.config.ping_max_errors).await?;
        if contact.identity == self.local.identity {
            return Err(DhtError::ProtocolViolation(format!("{addr} answered with the local id")));
        }
        self.observe(contact.clone(), !contact.firewalled).await;
        Ok(contact)
    }

    fn observer(&self) -> Arc<dyn LookupObserver> {
        Arc::new(NodeObserver {
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Spawn a lookup that stops when `parent` is cancelled.
    fn spawn_lookup(
        &self,
        kind: LookupKind,
        extra_seeds: Vec<Contact>,
        parent: &CancellationToken,
    ) -> DhtFuture<LookupOutcome> {
        let node = self.clone();
        DhtFuture::spawn(Some(parent), move |token| async move {
            let k = node.config.effective_k();
            let mut seeds = node.select(kind.target(), k, SelectMode::All).await;
            seeds.extend(extra_seeds);
            lookup::run(
                node.network.clone(),
                node.observer(),
                LookupParams::from(&*node.config),
                kind,
                seeds,
                token,
            )
            .await
        })
    }

    /// Iterative FIND_NODE.
    pub fn find_node(&self, target: Key) -> DhtFuture<LookupOutcome> {
        self.spawn_lookup(LookupKind::Node { target }, Vec::new(), &self.shutdown)
    }

    /// Iterative FIND_VALUE.
    pub fn find_value(&self, key: Key, value_type: Option<ValueType>) -> DhtFuture<LookupOutcome> {
        self.spawn_lookup(LookupKind::Value { key, value_type }, Vec::new(), &self.shutdown)
    }

    /// Lookup for the local id, seeded with `seeds` on top of the table.
    pub fn bootstrap_from(&self, seeds: Vec<Contact>) -> DhtFuture<LookupOutcome> {
        self.bootstrap_within(seeds, &self.shutdown)
    }

    /// [`bootstrap_from`](Self::bootstrap_from) scoped to `parent`: cancelling
    /// `parent` stops the lookup.
    pub fn bootstrap_within(&self, seeds: Vec<Contact>, parent: &CancellationToken) -> DhtFuture<LookupOutcome> {
        self.spawn_lookup(LookupKind::Node { target: self.local.identity }, seeds, parent)
    }

    /// Retrieve every value stored under `key`.
    ///
    /// Secondary keys the first responder holds but did not return are
    /// fetched from it directly. Local values answer when the network has
    /// none.
    pub fn get(&self, key: Key, value_type: Option<ValueType>) -> DhtFuture<Vec<DhtValue>> {
        let node = self.clone();
        DhtFuture::spawn(Some(&self.shutdown), move |token| async move {
            let lookup = node.spawn_lookup(LookupKind::Value { key, value_type }, Vec::new(), &token);
            match lookup.await {
                Ok(LookupOutcome::Values {
                    mut values,
                    remaining_keys,
                    responder,
                    ..
                }) => {
                    if !remaining_keys.is_empty() {
                        values.extend(node.fetch_remaining(&responder, key, remaining_keys, value_type).await);
                    }
                    Ok(values)
                }
                Ok(LookupOutcome::Nodes { .. }) => Err(DhtError::NoSuchValue { key }),
                Err(DhtError::NoSuchValue { .. }) | Err(DhtError::NoSuchNode { .. }) => {
                    let local = node.get_local(key, value_type).await;
                    if local.is_empty() {
                        Err(DhtError::NoSuchValue { key })
                    } else {
                        Ok(local)
                    }
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Ask `responder` for `secondary_keys` until every key arrived or a
    /// round brings nothing new. A large bag takes several rounds since each
    /// answer carries one datagram's worth of values.
    async fn fetch_remaining(
        &self,
        responder: &Contact,
        key: Key,
        secondary_keys: Vec<Key>,
        value_type: Option<ValueType>,
    ) -> Vec<DhtValue> {
        let mut wanted: HashSet<Key> = secondary_keys.into_iter().collect();
        let mut fetched = Vec::new();
        while !wanted.is_empty() {
            let request = DhtRequest::FindValue {
                key,
                secondary_keys: wanted.iter().copied().collect(),
                value_type,
            };
            let outcome = send_with_resend(
                &*self.network,
                responder.addr,
                request,
                self.config.rpc_timeout,
                self.config.lookup_max_errors,
            )
            .await;
            let values = match outcome.into_result() {
                Ok((_, DhtResponse::Values { values, .. }, _)) => values,
                Ok((_, other, _)) => {
                    debug!(from = %responder.addr, response = other.name(), "follow-up FIND_VALUE returned no values");
                    break;
                }
                Err(e) => {
                    debug!(from = %responder.addr, error = %e, "follow-up FIND_VALUE failed");
                    break;
                }
            };

            let before = fetched.len();
            fetched.extend(
                values
                    .into_iter()
                    .filter(|v| v.primary_key == key && wanted.remove(&v.secondary_key))
                    .filter(|v| value_type.is_none_or(|t| t == v.value_type)),
            );
            if fetched.len() == before {
                break;
            }
        }
        fetched
    }

    pub async fn get_local(&self, key: Key, value_type: Option<ValueType>) -> Vec<DhtValue> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLocal(key, value_type, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn store_local(&self, value: DhtValue) -> StoreCode {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StoreLocal(value, tx)).await.is_err() {
            return StoreCode::Rejected;
        }
        rx.await.unwrap_or(StoreCode::Rejected)
    }

    /// Store `value` locally as an original and publish it to the `k`
    /// nodes closest to its key.
    pub fn put(&self, value: DhtValue) -> DhtFuture<StoreSummary> {
        let node = self.clone();
        DhtFuture::spawn(Some(&self.shutdown), move |token| async move {
            let key = value.primary_key;
            if node.store_local(value.clone()).await == StoreCode::Rejected {
                return Err(DhtError::ProtocolViolation(format!("local store of {} rejected", key.short())));
            }
            node.publish(key, vec![value], &token).await
        })
    }

    /// Send `values` (all under `key`) to the nodes closest to `key`.
    /// Values that no node accepted stay due for republishing.
    async fn publish(
        &self,
        key: Key,
        values: Vec<DhtValue>,
        parent: &CancellationToken,
    ) -> Result<StoreSummary, DhtError> {
        let lookup = self.spawn_lookup(LookupKind::Node { target: key }, Vec::new(), parent);
        let closest = match lookup.await {
            Ok(LookupOutcome::Nodes { closest, .. }) => closest,
            Ok(LookupOutcome::Values { .. }) => Vec::new(),
            Err(DhtError::NoSuchNode { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut summary = StoreSummary::new(key);
        let mut accepted: HashSet<Key> = HashSet::new();
        let mut stores = JoinSet::new();
        for contact in closest.into_iter().take(self.config.effective_k()) {
            let network = self.network.clone();
            let values = values.clone();
            let timeout = self.config.rpc_timeout;
            let max_errors = self.config.store_max_errors;
            stores.spawn(async move {
                let result = rpc::store_batched(&*network, &contact, values, timeout, max_errors).await;
                (contact, result)
            });
        }

        while let Some(joined) = stores.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            if let Ok(statuses) = &result {
                accepted.extend(
                    statuses
                        .iter()
                        .filter(|s| s.code == StoreCode::Stored)
                        .map(|s| s.secondary_key),
                );
            }
            match result {
                Ok(statuses) if statuses.iter().all(|s| s.code == StoreCode::Stored) => {
                    self.observe(contact.clone(), true).await;
                    summary.stored_at.push(contact);
                }
                Ok(_) => {
                    self.observe(contact.clone(), true).await;
                    summary.rejected_by.push(contact);
                }
                Err(e) => {
                    trace!(to = %contact.addr, error = %e, "store failed");
                    if matches!(e, DhtError::Timeout { .. }) {
                        self.handle_failure(contact.identity).await;
                    }
                    summary.failed.push(contact);
                }
            }
        }

        for value in values.iter().filter(|v| accepted.contains(&v.secondary_key)) {
            let _ = self
                .cmd_tx
                .send(Command::MarkPublished(value.primary_key, value.secondary_key))
                .await;
        }
        debug!(
            key = %key.short(),
            stored = summary.stored_at.len(),
            rejected = summary.rejected_by.len(),
            failed = summary.failed.len(),
            "published values"
        );
        Ok(summary)
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let period = node.config.bucket_refresh_interval;
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let (tx, rx) = oneshot::channel();
                if node.cmd_tx.send(Command::StaleTargets(period, tx)).await.is_err() {
                    break;
                }
                let Ok(targets) = rx.await else {
                    break;
                };
                if targets.is_empty() {
                    continue;
                }

                debug!(count = targets.len(), "refreshing stale routing buckets");
                for target in targets {
                    if let Err(e) = node.find_node(target).await {
                        debug!(target = %target.short(), error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkRefreshed(target)).await;
                }
            }
        });
    }

    fn spawn_periodic_republish(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.republish_check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                node.republish_now().await;
            }
        });
    }

    /// Expire stale values and republish everything that is due.
    pub async fn republish_now(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::CollectRepublish(tx)).await.is_err() {
            return 0;
        }
        let Ok(due) = rx.await else {
            return 0;
        };
        if due.is_empty() {
            return 0;
        }

        let mut by_key: HashMap<Key, Vec<DhtValue>> = HashMap::new();
        for value in due {
            by_key.entry(value.primary_key).or_default().push(value);
        }
        let keys = by_key.len();
        debug!(keys, "republishing values");
        for (key, values) in by_key {
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.publish(key, values, &self.shutdown).await {
                debug!(key = %key.short(), error = %e, "republish failed");
            }
        }
        keys
    }

    /// Stop background work, close the transport and stop the actor.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.network.close().await;
        let _ = self.cmd_tx.send(Command::Quit).await;
        info!(id = %self.local.identity.short(), "DHT node closed");
    }
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(contact, is_live) => {
                    self.handle_observe(contact, is_live);
                }
                Command::Failure(id) => {
                    if let Some(evicted) = self.routing.handle_failure(&id) {
                        trace!(id = %evicted.identity.short(), "contact evicted after failures");
                    }
                }
                Command::ApplyProbeResult(probe, alive) => {
                    self.probing.remove(&probe.identity);
                    self.routing.apply_probe_result(&probe, alive);
                }
                Command::MarkPublished(primary, secondary) => {
                    self.database.mark_published(&primary, &secondary, now_ms());
                }
                Command::MarkRefreshed(id) => {
                    self.routing.mark_refreshed(&id);
                }
                Command::Restore(snapshot) => {
                    let contacts = snapshot.contacts.len();
                    let values = snapshot.values.len();
                    for contact in snapshot.contacts {
                        let _ = self.routing.add(contact, false);
                    }
                    self.database.restore(snapshot.values);
                    debug!(contacts, values, "restored persisted state");
                }
                Command::Select(key, count, mode, reply) => {
                    let _ = reply.send(self.routing.select(&key, count, mode));
                }
                Command::MrsContacts(count, reply) => {
                    let _ = reply.send(self.routing.mrs_contacts(count));
                }
                Command::GetLocal(key, value_type, reply) => {
                    let _ = reply.send(self.database.get(&key, &[], value_type));
                }
                Command::StoreLocal(value, reply) => {
                    let _ = reply.send(self.database.store(value, true));
                }
                Command::Snapshot(reply) => {
                    let snapshot = NodeSnapshot {
                        contacts: self.routing.all_nodes(),
                        values: self.database.entities().cloned().collect(),
                    };
                    let _ = reply.send(snapshot);
                }
                Command::Stats(reply) => {
                    let stats = NodeStats {
                        contacts: self.routing.len(),
                        buckets: self.routing.all_buckets().len(),
                        pinned: self.routing.pinned_leaves().len(),
                        keys: self.database.key_count(),
                        values: self.database.len(),
                    };
                    let _ = reply.send(stats);
                }
                Command::StaleTargets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_refresh_targets(threshold));
                }
                Command::CollectRepublish(reply) => {
                    let _ = reply.send(self.collect_republish());
                }
                Command::AddPinned(contact, reply) => {
                    let _ = reply.send(self.routing.add_pinned_leaf(contact));
                }
                Command::RemovePinned(addr, reply) => {
                    let _ = reply.send(self.routing.remove_pinned_leaf(&addr));
                }
                Command::PinnedLeaves(reply) => {
                    let _ = reply.send(self.routing.pinned_leaves());
                }
                Command::HandleRequest(incoming) => {
                    self.handle_request(incoming);
                }
                Command::Quit => break,
            }
        }
    }

    fn handle_observe(&mut self, contact: Contact, is_live: bool) {
        if contact.identity == self.local.identity || !contact.has_routable_addr() || contact.firewalled {
            return;
        }
        if let AddOutcome::CachedAsReplacement { probe: Some(probe) } = self.routing.add(contact, is_live) {
            self.spawn_probe(probe);
        }
    }

    /// Ping a least-recently-seen contact and feed the result back.
    fn spawn_probe(&mut self, probe: Contact) {
        if probe.is_pinned() || !self.probing.insert(probe.identity) {
            return;
        }
        let network = self.network.clone();
        let tx = self.cmd_tx.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let alive = matches!(
                rpc::ping(&*network, probe.addr, timeout, 0).await,
                Ok(contact) if contact.identity == probe.identity
            );
            let _ = tx.send(Command::ApplyProbeResult(probe, alive)).await;
        });
    }

    fn handle_request(&mut self, incoming: IncomingRequest) {
        let IncomingRequest {
            from,
            source,
            request,
            reply,
        } = incoming;

        if from.identity == self.local.identity {
            warn!(%source, "request claims the local id");
        } else {
            self.handle_observe(from.clone(), true);
        }

        let k = self.config.effective_k().min(MAX_CONTACTS_PER_RESPONSE);
        let response = match request {
            DhtRequest::Ping => DhtResponse::Pong { observed_addr: source },
            DhtRequest::FindNode { target } => DhtResponse::Nodes {
                contacts: self.answer_contacts(&target, k, &from),
            },
            DhtRequest::FindValue {
                key,
                secondary_keys,
                value_type,
            } => {
                let values = self.database.get(&key, &secondary_keys, value_type);
                if values.is_empty() {
                    DhtResponse::Nodes {
                        contacts: self.answer_contacts(&key, k, &from),
                    }
                } else {
                    // Whatever does not fit stays listed in available_keys
                    // for the requester to fetch in a follow-up.
                    let available_keys = self.database.available_keys(&key);
                    let values = batch_values(values, encoded_len(&available_keys))
                        .into_iter()
                        .next()
                        .unwrap_or_default();
                    DhtResponse::Values { values, available_keys }
                }
            }
            DhtRequest::Store { values } => {
                let statuses = values
                    .into_iter()
                    .map(|value| StoreStatus {
                        primary_key: value.primary_key,
                        secondary_key: value.secondary_key,
                        code: self.database.store(value, false),
                    })
                    .collect();
                DhtResponse::StoreStatus { statuses }
            }
        };
        trace!(%source, response = response.name(), "answered request");
        let _ = reply.send(response);
    }

    fn answer_contacts(&self, target: &Key, k: usize, requester: &Contact) -> Vec<Contact> {
        let mut contacts = self.routing.select(target, k + 1, SelectMode::Live);
        contacts.retain(|c| c.identity != requester.identity);
        if !self.local.firewalled {
            let local_distance = self.local.identity.xor_distance(target);
            let pos = contacts
                .iter()
                .position(|c| !c.is_pinned() && c.identity.xor_distance(target) > local_distance)
                .unwrap_or(contacts.len());
            contacts.insert(pos, self.local.clone());
        }
        contacts.truncate(k);
        contacts
    }

    fn collect_republish(&mut self) -> Vec<DhtValue> {
        let now = now_ms();
        let oracle = self.oracle.clone();
        let expired = self.database.expire(now, |key| oracle.is_proxy_current(key));
        if !expired.is_empty() {
            trace!(count = expired.len(), "values expired before republish");
        }
        if self.mode == DhtMode::Passive {
            let dropped = self.database.sweep_relayed();
            if dropped > 0 {
                debug!(dropped, "dropped relayed values after publication");
            }
        }
        self.database
            .due_for_republish(now, self.config.republish_interval, self.mode, |key| oracle.is_rare(key))
    }
}
