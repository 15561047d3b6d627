//! # RPC Layer
//!
//! Request tracking, resend and response correlation over UDP.
//!
//! ## Contract
//!
//! Every [`DhtNodeRpc::send`] produces exactly one [`RpcOutcome`]:
//! a response, a timeout, or an error. The outcome travels through a
//! `oneshot` channel, so a second delivery is impossible by construction.
//! A response that shows up after its timeout finds no pending entry and is
//! dropped.
//!
//! Resending is a caller concern: [`send_with_resend`] wraps a single send
//! with a per-call error budget so lookups, pings and stores can each pick
//! their own `max_errors`.
//!
//! ## Architecture
//!
//! [`UdpRpc`] is a cheap-to-clone handle. `UdpRpcActor` owns the socket's
//! receive side and the pending-request table, multiplexing commands and
//! datagrams in one `select!` loop. Inbound requests are forwarded to the
//! node as [`IncomingRequest`]s and answered from a spawned task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::identity::{Contact, Identity};
use crate::messages::{
    Body, DhtRequest, DhtResponse, DhtValue, Envelope, MAX_DATAGRAM_SIZE, StoreStatus, TxId, batch_values,
};
use crate::protocols::{DhtNodeRpc, IncomingRequest, NetworkBinder};

/// Command channel capacity for the RPC actor.
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Inbound requests buffered before new ones are dropped.
const INCOMING_CHANNEL_SIZE: usize = 256;

/// Pending entries older than this are purged even if no cancel arrived.
const PENDING_MAX_AGE: Duration = Duration::from_secs(120);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// The single terminal result of one request.
#[derive(Debug)]
pub enum RpcOutcome {
    Response {
        from: Contact,
        response: DhtResponse,
        elapsed: Duration,
    },
    Timeout {
        request: DhtRequest,
        elapsed: Duration,
    },
    Error(DhtError),
}

impl RpcOutcome {
    pub fn is_response(&self) -> bool {
        matches!(self, RpcOutcome::Response { .. })
    }

    pub fn into_result(self) -> Result<(Contact, DhtResponse, Duration), DhtError> {
        match self {
            RpcOutcome::Response { from, response, elapsed } => Ok((from, response, elapsed)),
            RpcOutcome::Timeout { elapsed, .. } => Err(DhtError::Timeout { elapsed }),
            RpcOutcome::Error(err) => Err(err),
        }
    }
}

/// Send `request`, resending on timeout until `max_errors` resends are spent.
///
/// Errors other than timeouts are terminal immediately.
pub async fn send_with_resend<N: DhtNodeRpc + ?Sized>(
    network: &N,
    to: SocketAddr,
    request: DhtRequest,
    timeout: Duration,
    max_errors: usize,
) -> RpcOutcome {
    let started = Instant::now();
    let mut errors = 0;
    loop {
        match network.send(to, request.clone(), timeout).await {
            RpcOutcome::Timeout { .. } if errors < max_errors => {
                errors += 1;
                trace!(%to, kind = request.name(), attempt = errors, "resending after timeout");
            }
            RpcOutcome::Timeout { request, .. } => {
                return RpcOutcome::Timeout {
                    request,
                    elapsed: started.elapsed(),
                };
            }
            RpcOutcome::Response { from, response, .. } => {
                return RpcOutcome::Response {
                    from,
                    response,
                    elapsed: started.elapsed(),
                };
            }
            error @ RpcOutcome::Error(_) => return error,
        }
    }
}

/// Reject responses whose sender claims the local id from another address.
pub(crate) fn check_spoof(local: &Contact, from: &Contact) -> Result<(), DhtError> {
    if from.identity == local.identity && from.addr != local.addr {
        return Err(DhtError::ProtocolViolation(format!(
            "{} claims the local id",
            from.addr
        )));
    }
    Ok(())
}

/// Liveness probe by address. Returns the responder's contact.
pub(crate) async fn ping<N: DhtNodeRpc + ?Sized>(
    network: &N,
    to: SocketAddr,
    timeout: Duration,
    max_errors: usize,
) -> Result<Contact, DhtError> {
    let (from, response, _) = send_with_resend(network, to, DhtRequest::Ping, timeout, max_errors)
        .await
        .into_result()?;
    check_spoof(&network.local_contact(), &from)?;
    match response {
        DhtResponse::Pong { .. } => Ok(from),
        other => Err(DhtError::ProtocolViolation(format!(
            "expected PONG, got {}",
            other.name()
        ))),
    }
}

/// Store values on one contact. The status list must match the value count.
pub(crate) async fn store<N: DhtNodeRpc + ?Sized>(
    network: &N,
    to: &Contact,
    values: Vec<DhtValue>,
    timeout: Duration,
    max_errors: usize,
) -> Result<Vec<StoreStatus>, DhtError> {
    let expected = values.len();
    let request = DhtRequest::Store { values };
    let (_, response, _) = send_with_resend(network, to.addr, request, timeout, max_errors)
        .await
        .into_result()?;
    match response {
        DhtResponse::StoreStatus { statuses } if statuses.len() == expected => Ok(statuses),
        DhtResponse::StoreStatus { statuses } => Err(DhtError::ProtocolViolation(format!(
            "expected {expected} store statuses, got {}",
            statuses.len()
        ))),
        other => Err(DhtError::ProtocolViolation(format!(
            "expected STORE_STATUS, got {}",
            other.name()
        ))),
    }
}

/// Store values on one contact, split over as many STORE requests as one
/// datagram each allows. Fails on the first batch that fails.
pub(crate) async fn store_batched<N: DhtNodeRpc + ?Sized>(
    network: &N,
    to: &Contact,
    values: Vec<DhtValue>,
    timeout: Duration,
    max_errors: usize,
) -> Result<Vec<StoreStatus>, DhtError> {
    let mut statuses = Vec::with_capacity(values.len());
    for batch in batch_values(values, 0) {
        statuses.extend(store(network, to, batch, timeout, max_errors).await?);
    }
    Ok(statuses)
}

/// Address stamped on outgoing envelopes: the host's external IP with the
/// bound port when the host knows one, the bound address otherwise.
pub(crate) fn advertised_addr(bound: SocketAddr, external: Option<SocketAddr>) -> SocketAddr {
    match external {
        Some(external) if !external.ip().is_unspecified() => SocketAddr::new(external.ip(), bound.port()),
        _ => bound,
    }
}

// ============================================================================
// UDP transport
// ============================================================================

type PendingReply = oneshot::Sender<Result<(Contact, DhtResponse), DhtError>>;

enum RpcCommand {
    Send {
        txid: TxId,
        to: SocketAddr,
        request: DhtRequest,
        reply: PendingReply,
    },
    Cancel {
        txid: TxId,
    },
    Quit,
}

struct PendingRequest {
    to: SocketAddr,
    sent_at: Instant,
    reply: PendingReply,
}

struct UdpRpcActor {
    socket: Arc<UdpSocket>,
    local: Contact,
    pending: HashMap<TxId, PendingRequest>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
}

impl UdpRpcActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::Send { txid, to, request, reply }) => {
                            self.handle_send(txid, to, request, reply).await;
                        }
                        Some(RpcCommand::Cancel { txid }) => {
                            if self.pending.remove(&txid).is_some() {
                                trace!(txid, "pending request cancelled");
                            }
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!(addr = %self.local.addr, "UDP RPC actor shutting down");
                            break;
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                        Err(e) => {
                            // ICMP port-unreachable surfaces here on some platforms.
                            trace!(error = %e, "UDP receive error");
                        }
                    }
                }
                _ = cleanup.tick() => {
                    let before = self.pending.len();
                    self.pending.retain(|_, p| p.sent_at.elapsed() < PENDING_MAX_AGE);
                    if self.pending.len() != before {
                        debug!(purged = before - self.pending.len(), "purged stale pending requests");
                    }
                }
            }
        }
    }

    async fn handle_send(&mut self, txid: TxId, to: SocketAddr, request: DhtRequest, reply: PendingReply) {
        let envelope = Envelope {
            txid,
            from: self.local.clone(),
            body: Body::Request(request),
        };
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(DhtError::ProtocolViolation(format!("encode failed: {e}"))));
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            let _ = reply.send(Err(DhtError::from(e)));
            return;
        }
        self.pending.insert(
            txid,
            PendingRequest {
                to,
                sent_at: Instant::now(),
                reply,
            },
        );
    }

    fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%source, error = %e, "dropping malformed datagram");
                return;
            }
        };

        match envelope.body {
            Body::Response(response) => {
                let Some(pending) = self.pending.remove(&envelope.txid) else {
                    trace!(%source, txid = envelope.txid, "late or unsolicited response dropped");
                    return;
                };
                if pending.to != source {
                    debug!(
                        expected = %pending.to,
                        %source,
                        "response came from an unexpected address"
                    );
                    self.pending.insert(envelope.txid, pending);
                    return;
                }
                let mut from = envelope.from;
                from.addr = source;
                let _ = pending.reply.send(Ok((from, response)));
            }
            Body::Request(request) => {
                let mut from = envelope.from;
                if !from.firewalled {
                    from.addr = source;
                }
                let (reply_tx, reply_rx) = oneshot::channel();
                let incoming = IncomingRequest {
                    from,
                    source,
                    request,
                    reply: reply_tx,
                };
                if self.incoming_tx.try_send(incoming).is_err() {
                    warn!(%source, "inbound request queue full, dropping request");
                    return;
                }

                let socket = self.socket.clone();
                let local = self.local.clone();
                let txid = envelope.txid;
                tokio::spawn(async move {
                    let Ok(response) = reply_rx.await else {
                        return;
                    };
                    let envelope = Envelope {
                        txid,
                        from: local,
                        body: Body::Response(response),
                    };
                    match envelope.encode() {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, source).await {
                                debug!(%source, error = %e, "failed to send response");
                            }
                        }
                        Err(e) => warn!(%source, error = %e, "failed to encode response"),
                    }
                });
            }
        }
    }
}

/// UDP transport handle.
#[derive(Clone)]
pub struct UdpRpc {
    cmd_tx: mpsc::Sender<RpcCommand>,
    local: Contact,
    bound: SocketAddr,
    next_txid: Arc<AtomicU64>,
}

impl UdpRpc {
    /// Bind a UDP socket and spawn the actor. `external` overrides the
    /// advertised IP (see [`advertised_addr`]).
    pub async fn bind(
        addr: SocketAddr,
        identity: Identity,
        firewalled: bool,
        external: Option<SocketAddr>,
    ) -> Result<(Self, mpsc::Receiver<IncomingRequest>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        let local_addr = socket.local_addr().context("failed to read bound address")?;
        let local = Contact::seen_now(identity, advertised_addr(local_addr, external)).with_firewalled(firewalled);

        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);

        let actor = UdpRpcActor {
            socket: Arc::new(socket),
            local: local.clone(),
            pending: HashMap::new(),
            incoming_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        debug!(addr = %local_addr, id = %identity.short(), "UDP RPC bound");
        Ok((
            Self {
                cmd_tx,
                local,
                bound: local_addr,
                next_txid: Arc::new(AtomicU64::new(rand::random())),
            },
            incoming_rx,
        ))
    }

    /// Address the socket is bound to, which may differ from the advertised one.
    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }
}

#[async_trait]
impl DhtNodeRpc for UdpRpc {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    async fn send(&self, to: SocketAddr, request: DhtRequest, timeout: Duration) -> RpcOutcome {
        let started = Instant::now();
        let txid = self.next_txid.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RpcCommand::Send {
            txid,
            to,
            request: request.clone(),
            reply: reply_tx,
        };
        if self.cmd_tx.send(command).await.is_err() {
            return RpcOutcome::Error(DhtError::Closed);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok((from, response)))) => RpcOutcome::Response {
                from,
                response,
                elapsed: started.elapsed(),
            },
            Ok(Ok(Err(e))) => RpcOutcome::Error(e),
            Ok(Err(_)) => RpcOutcome::Error(DhtError::Closed),
            Err(_) => {
                let _ = self.cmd_tx.send(RpcCommand::Cancel { txid }).await;
                RpcOutcome::Timeout {
                    request,
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }
}

/// Binds [`UdpRpc`] endpoints.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpBinder;

#[async_trait]
impl NetworkBinder for UdpBinder {
    type Rpc = UdpRpc;

    async fn bind(
        &self,
        addr: SocketAddr,
        identity: Identity,
        firewalled: bool,
        external: Option<SocketAddr>,
    ) -> Result<(UdpRpc, mpsc::Receiver<IncomingRequest>)> {
        UdpRpc::bind(addr, identity, firewalled, external).await
    }
}
