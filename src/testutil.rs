//! In-memory network shared by unit tests.
//!
//! Every bound endpoint registers its request channel in a
//! [`NetworkRegistry`] under a synthetic address. Requests are delivered
//! through that channel exactly as the UDP transport would deliver them, so
//! nodes under test run their real request handlers. Addresses can be made
//! unreachable, slow, or made to answer under a forged contact.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep};

use crate::error::DhtError;
use crate::identity::{Contact, Identity};
use crate::messages::DhtRequest;
use crate::protocols::{DhtNodeRpc, IncomingRequest, NetworkBinder};
use crate::rpc::{RpcOutcome, advertised_addr};

const TEST_CHANNEL_SIZE: usize = 256;

struct Peer {
    contact: Contact,
    tx: mpsc::Sender<IncomingRequest>,
}

#[derive(Default)]
pub(crate) struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, Peer>>,
    unreachable: RwLock<HashSet<SocketAddr>>,
    latencies: RwLock<HashMap<SocketAddr, Duration>>,
    /// Contact an address answers under instead of its own.
    forged: RwLock<HashMap<SocketAddr, Contact>>,
    /// Requests sent to each address, delivered or not.
    sent: RwLock<HashMap<SocketAddr, usize>>,
    next_port: AtomicU16,
}

impl NetworkRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(1),
            ..Self::default()
        })
    }

    fn allocate_addr(&self) -> SocketAddr {
        let n = self.next_port.fetch_add(1, Ordering::SeqCst);
        SocketAddr::from(([10, 77, (n >> 8) as u8, n as u8], 4000))
    }

    pub(crate) async fn set_unreachable(&self, addr: SocketAddr, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    pub(crate) async fn set_latency(&self, addr: SocketAddr, latency: Duration) {
        self.latencies.write().await.insert(addr, latency);
    }

    pub(crate) async fn forge(&self, addr: SocketAddr, claimed: Contact) {
        self.forged.write().await.insert(addr, claimed);
    }

    pub(crate) async fn requests_to(&self, addr: &SocketAddr) -> usize {
        self.sent.read().await.get(addr).copied().unwrap_or(0)
    }

    pub(crate) async fn is_registered(&self, addr: &SocketAddr) -> bool {
        self.peers.read().await.contains_key(addr)
    }

    async fn unregister(&self, addr: &SocketAddr) {
        self.peers.write().await.remove(addr);
    }
}

#[derive(Clone)]
pub(crate) struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    local: Contact,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DhtNodeRpc for TestNetwork {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    async fn send(&self, to: SocketAddr, request: DhtRequest, timeout: Duration) -> RpcOutcome {
        let started = Instant::now();
        if self.closed.load(Ordering::SeqCst) {
            return RpcOutcome::Error(DhtError::Closed);
        }
        *self.registry.sent.write().await.entry(to).or_default() += 1;

        let latency = self.registry.latencies.read().await.get(&to).copied();
        if let Some(latency) = latency {
            sleep(latency.min(timeout)).await;
            if latency >= timeout {
                return RpcOutcome::Timeout { request, elapsed: started.elapsed() };
            }
        }

        let unreachable = self.registry.unreachable.read().await.contains(&to);
        let target = if unreachable {
            None
        } else {
            self.registry
                .peers
                .read()
                .await
                .get(&to)
                .map(|p| (p.contact.clone(), p.tx.clone()))
        };
        let Some((contact, tx)) = target else {
            sleep(timeout.saturating_sub(started.elapsed())).await;
            return RpcOutcome::Timeout { request, elapsed: started.elapsed() };
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let incoming = IncomingRequest {
            from: self.local.clone(),
            source: self.local.addr,
            request: request.clone(),
            reply: reply_tx,
        };
        if tx.send(incoming).await.is_err() {
            return RpcOutcome::Timeout { request, elapsed: started.elapsed() };
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, reply_rx).await {
            Ok(Ok(response)) => {
                let from = self
                    .registry
                    .forged
                    .read()
                    .await
                    .get(&to)
                    .cloned()
                    .unwrap_or(contact);
                RpcOutcome::Response { from, response, elapsed: started.elapsed() }
            }
            Ok(Err(_)) | Err(_) => RpcOutcome::Timeout { request, elapsed: started.elapsed() },
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.unregister(&self.local.addr).await;
    }
}

#[derive(Clone)]
pub(crate) struct TestBinder {
    pub(crate) registry: Arc<NetworkRegistry>,
}

impl TestBinder {
    pub(crate) fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NetworkBinder for TestBinder {
    type Rpc = TestNetwork;

    async fn bind(
        &self,
        addr: SocketAddr,
        identity: Identity,
        firewalled: bool,
        external: Option<SocketAddr>,
    ) -> Result<(TestNetwork, mpsc::Receiver<IncomingRequest>)> {
        let addr = if addr.port() == 0 { self.registry.allocate_addr() } else { addr };
        let addr = advertised_addr(addr, external);
        let mut peers = self.registry.peers.write().await;
        if peers.contains_key(&addr) {
            bail!("address {addr} already bound");
        }
        let local = Contact::seen_now(identity, addr).with_firewalled(firewalled);
        let (tx, rx) = mpsc::channel(TEST_CHANNEL_SIZE);
        peers.insert(addr, Peer { contact: local.clone(), tx });
        drop(peers);

        Ok((
            TestNetwork {
                registry: self.registry.clone(),
                local,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }
}
