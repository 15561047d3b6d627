//! Host overlay collaborators.
//!
//! The DHT runs inside a larger peer-to-peer application that owns the
//! "wider network" connection. That application is consumed through two
//! narrow traits:
//!
//! - [`HostOverlay`]: connectivity, the external address, DHT fitness and
//!   capability announcements
//! - [`ResourceOracle`]: whether a locally announced resource is still worth
//!   announcing, and whether the local proxy set is still current
//!
//! [`DhtEvent`] travels the other way, from the DHT to its subscribers.
//!
//! [`StaticHost`] is a fixed-answer implementation used by the binary and by
//! tests.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::Key;

/// Role a running node plays in the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhtMode {
    /// Full participant: routable, stores values, persists full state.
    Active,
    /// Firewalled participant that relays for its directly connected leaves.
    Passive,
}

impl std::fmt::Display for DhtMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DhtMode::Active => f.write_str("active"),
            DhtMode::Passive => f.write_str("passive"),
        }
    }
}

/// Connection lifecycle notifications from the host overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The host joined the wider network.
    Connected,
    /// The host lost its connection to the wider network.
    Disconnected,
    /// The host's externally reachable address changed.
    AddressChanged,
    /// A directly connected peer announced itself as DHT-capable.
    LeafDhtCapable { addr: SocketAddr },
    /// The connection to a directly connected peer closed.
    LeafClosed { addr: SocketAddr },
}

/// State changes a running DHT reports to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtEvent {
    Starting { mode: DhtMode },
    /// Bootstrap succeeded.
    Connected { mode: DhtMode },
    /// Every bootstrap source is exhausted; waiting for new hosts.
    Waiting { mode: DhtMode },
    Stopped { mode: DhtMode },
}

#[async_trait]
pub trait HostOverlay: Send + Sync + 'static {
    /// Connected to the wider network.
    fn is_connected(&self) -> bool;

    /// Externally reachable address, if known.
    fn external_addr(&self) -> Option<SocketAddr>;

    /// Designated DHT-capable by the host's fitness check.
    fn is_dht_capable(&self) -> bool;

    /// Announce the current DHT role to overlay peers (`None` = withdrawn).
    async fn send_capabilities(&self, mode: Option<DhtMode>);
}

pub trait ResourceOracle: Send + Sync + 'static {
    /// A locally announced resource is scarce enough to keep announcing.
    fn is_rare(&self, key: &Key) -> bool;

    /// The local proxy record stored under `key` still reflects the node's
    /// current proxies.
    fn is_proxy_current(&self, key: &Key) -> bool;
}

/// Host with settable answers. Capability announcements are recorded.
#[derive(Debug)]
pub struct StaticHost {
    connected: AtomicBool,
    capable: AtomicBool,
    external: Mutex<Option<SocketAddr>>,
    announcements: Mutex<Vec<Option<DhtMode>>>,
}

impl StaticHost {
    pub fn new(connected: bool, capable: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            capable: AtomicBool::new(capable),
            external: Mutex::new(None),
            announcements: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_capable(&self, capable: bool) {
        self.capable.store(capable, Ordering::SeqCst);
    }

    pub fn set_external_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut external) = self.external.lock() {
            *external = addr;
        }
    }

    /// Every capability announcement made so far, oldest first.
    pub fn announcements(&self) -> Vec<Option<DhtMode>> {
        self.announcements
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

impl Default for StaticHost {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl HostOverlay for StaticHost {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn external_addr(&self) -> Option<SocketAddr> {
        self.external.lock().ok().and_then(|a| *a)
    }

    fn is_dht_capable(&self) -> bool {
        self.capable.load(Ordering::SeqCst)
    }

    async fn send_capabilities(&self, mode: Option<DhtMode>) {
        if let Ok(mut announcements) = self.announcements.lock() {
            announcements.push(mode);
        }
    }
}

/// Oracle answering from fixed key sets.
#[derive(Debug, Default)]
pub struct StaticOracle {
    rare: Mutex<Vec<Key>>,
    stale_proxies: Mutex<Vec<Key>>,
    all_rare: bool,
}

impl StaticOracle {
    /// Every resource counts as rare.
    pub fn all_rare() -> Self {
        Self {
            all_rare: true,
            ..Self::default()
        }
    }

    pub fn mark_rare(&self, key: Key) {
        if let Ok(mut rare) = self.rare.lock() {
            rare.push(key);
        }
    }

    pub fn mark_proxy_stale(&self, key: Key) {
        if let Ok(mut stale) = self.stale_proxies.lock() {
            stale.push(key);
        }
    }
}

impl ResourceOracle for StaticOracle {
    fn is_rare(&self, key: &Key) -> bool {
        self.all_rare || self.rare.lock().map(|r| r.contains(key)).unwrap_or(false)
    }

    fn is_proxy_current(&self, key: &Key) -> bool {
        !self
            .stale_proxies
            .lock()
            .map(|s| s.contains(key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_host_records_announcements() {
        let host = StaticHost::new(false, true);
        assert!(!host.is_connected());
        host.set_connected(true);
        assert!(host.is_connected());

        host.send_capabilities(Some(DhtMode::Active)).await;
        host.send_capabilities(None).await;
        assert_eq!(host.announcements(), vec![Some(DhtMode::Active), None]);
    }

    #[test]
    fn static_oracle_answers_from_sets() {
        let oracle = StaticOracle::default();
        let key = Key::from_content(b"file");
        assert!(!oracle.is_rare(&key));
        oracle.mark_rare(key);
        assert!(oracle.is_rare(&key));

        assert!(oracle.is_proxy_current(&key));
        oracle.mark_proxy_stale(key);
        assert!(!oracle.is_proxy_current(&key));

        assert!(StaticOracle::all_rare().is_rare(&Key::from_content(b"other")));
    }
}
