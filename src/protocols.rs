//! Transport abstractions consumed by the DHT engine.
//!
//! The engine never touches sockets directly. It sends through a
//! [`DhtNodeRpc`] and receives inbound requests as [`IncomingRequest`]s on a
//! channel handed out by a [`NetworkBinder`]. Production code binds a
//! [`UdpRpc`](crate::rpc::UdpRpc); tests bind an in-memory network.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::identity::{Contact, Identity};
use crate::messages::{DhtRequest, DhtResponse};
use crate::rpc::RpcOutcome;

/// An inbound request waiting for the local node's answer.
#[derive(Debug)]
pub struct IncomingRequest {
    /// Contact the sender claims to be.
    pub from: Contact,
    /// Address the datagram actually came from.
    pub source: SocketAddr,
    pub request: DhtRequest,
    pub reply: oneshot::Sender<DhtResponse>,
}

/// Outbound request dispatch.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// The contact stamped on every outgoing envelope.
    fn local_contact(&self) -> Contact;

    /// Send one request and wait for its single terminal outcome.
    ///
    /// Exactly one of response, timeout or error is produced. A response that
    /// arrives after the timeout fired is discarded silently.
    async fn send(&self, to: SocketAddr, request: DhtRequest, timeout: Duration) -> RpcOutcome;

    /// Stop sending and receiving. Outstanding sends resolve with an error.
    async fn close(&self);
}

/// Creates a transport endpoint for a node.
#[async_trait]
pub trait NetworkBinder: Send + Sync + 'static {
    type Rpc: DhtNodeRpc + Clone;

    /// Bind `addr`. When the host knows its `external` address, the local
    /// contact advertises that IP instead of the bound one.
    async fn bind(
        &self,
        addr: SocketAddr,
        identity: Identity,
        firewalled: bool,
        external: Option<SocketAddr>,
    ) -> Result<(Self::Rpc, mpsc::Receiver<IncomingRequest>)>;
}
