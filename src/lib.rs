//! # Kadmesh - Kademlia DHT Engine
//!
//! Kadmesh embeds a Kademlia-style distributed hash table into a host
//! peer-to-peer application:
//!
//! - **Routing**: 160-bit identities, XOR distance, splitting k-buckets with
//!   replacement caches and pinned leaf contacts
//! - **Lookups**: iterative FIND_NODE / FIND_VALUE with alpha fan-out, a boost
//!   timer and spoof rejection
//! - **Storage**: multi-value bags per key, TTL expiry and role-dependent
//!   republishing
//! - **Lifecycle**: ordered bootstrap sources, active and passive roles,
//!   persisted state and a serialized manager command queue
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**:
//! - Each component (manager, node, bootstrapper, UDP transport) has a
//!   public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! Long-running operations come back as [`DhtFuture`]s that can be awaited
//! or cancelled.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `manager` | Application entry point: start/stop, mode switching, events |
//! | `controller` | One session in one role: bind, restore, bootstrap, persist |
//! | `bootstrap` | Bootstrap source ordering and pre-emption |
//! | `dht` | Node actor: routing table, database, put/get, maintenance |
//! | `lookup` | Iterative lookup state machine and driver |
//! | `routing` | K-bucket routing table |
//! | `storage` | Value database and republish policy |
//! | `rpc` | Request/response dispatch and the UDP transport |
//! | `protocols` | Transport traits |
//! | `messages` | Wire types |
//! | `persistence` | On-disk state formats |
//! | `host` | Host overlay collaborators and events |
//! | `identity` | Identities, distance, contacts |

mod bootstrap;
mod config;
mod controller;
mod dht;
mod error;
mod host;
mod identity;
mod lookup;
mod manager;
mod messages;
mod persistence;
mod protocols;
mod routing;
mod rpc;
mod storage;
mod task;

#[cfg(test)]
mod testutil;

pub use bootstrap::{AddressSet, BootstrapPhase, BootstrapSource, Bootstrapper, fallback_index};
pub use config::DhtConfig;
pub use controller::DhtController;
pub use dht::{DhtNode, NodeSnapshot, NodeStats, StoreSummary};
pub use error::DhtError;
pub use host::{ConnectionEvent, DhtEvent, DhtMode, HostOverlay, ResourceOracle, StaticHost, StaticOracle};
pub use identity::{
    Contact, ContactState, Distance, ID_BITS, ID_LEN, Identity, Key, common_prefix_len, distance_cmp, is_closer,
};
pub use lookup::{LookupKind, LookupOutcome, LookupStats};
pub use manager::{DhtManager, DhtStatus};
pub use messages::{DhtRequest, DhtResponse, DhtValue, StoreCode, StoreStatus, ValueType};
pub use persistence::ActiveSnapshot;
pub use protocols::{DhtNodeRpc, IncomingRequest, NetworkBinder};
pub use routing::{AddOutcome, Bucket, RoutingTable, SelectMode};
pub use rpc::{RpcOutcome, UdpBinder, UdpRpc};
pub use storage::{Database, ValueEntity};
pub use task::DhtFuture;
