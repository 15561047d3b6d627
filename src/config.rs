//! Runtime configuration for the DHT engine.
//!
//! All tunables live in [`DhtConfig`]; `DhtConfig::default()` gives values
//! suitable for a production node. Tests shrink the timers.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::time::Duration;

/// Kademlia replication factor (bucket size and lookup result size).
pub const DEFAULT_K: usize = 20;

/// Parallel in-flight requests per lookup.
pub const DEFAULT_ALPHA: usize = 4;

/// Resends a lookup allows per contact before counting it as timed out.
pub const DEFAULT_LOOKUP_MAX_ERRORS: usize = 1;

/// Resends for liveness probes.
pub const DEFAULT_PING_MAX_ERRORS: usize = 2;

/// Resends for STORE requests.
pub const DEFAULT_STORE_MAX_ERRORS: usize = 1;

/// Per-request wait before a resend or timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on the duration of a single lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a lookup checks whether it should boost.
pub const DEFAULT_BOOST_FREQUENCY: Duration = Duration::from_secs(1);

/// Quiet period after which a boost query is issued.
pub const DEFAULT_BOOST_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive failures after which a contact is considered dead.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 4;

pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Lifetime of a stored value since it was created or last published.
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(60 * 60);

/// Age at which a local value is due for republishing.
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_REPUBLISH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Live network hints remembered by the bootstrapper.
pub const DEFAULT_BOOTSTRAP_HINT_CAPACITY: usize = 50;

/// Addresses remembered by the post-bootstrap node adder.
pub const DEFAULT_NODE_ADDER_CAPACITY: usize = 30;

pub const DEFAULT_NODE_ADDER_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Contacts written to the passive contact list.
pub const DEFAULT_MAX_PERSISTED_NODES: usize = 40;

/// Below this many contacts the passive list is not worth keeping.
pub const DEFAULT_MIN_PERSISTED_NODES: usize = 2;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct DhtConfig {
    // ========================================================================
    // Kademlia parameters
    // ========================================================================
    /// Bucket size and lookup result size.
    pub k: usize,
    /// Concurrent requests per lookup.
    pub alpha: usize,
    /// Replacement cache size per bucket.
    pub cache_size: usize,
    /// Failures after which a contact is dead.
    pub max_consecutive_failures: u32,

    // ========================================================================
    // RPC and lookup timing
    // ========================================================================
    pub rpc_timeout: Duration,
    pub lookup_max_errors: usize,
    pub ping_max_errors: usize,
    pub store_max_errors: usize,
    pub lookup_timeout: Duration,
    pub boost_frequency: Duration,
    pub boost_timeout: Duration,
    /// Tolerate FIND_NODE answers with no contacts (typical of nodes that are still bootstrapping).
    pub accept_empty_find_node_responses: bool,

    // ========================================================================
    // Maintenance
    // ========================================================================
    pub bucket_refresh_interval: Duration,
    pub value_ttl: Duration,
    pub republish_interval: Duration,
    pub republish_check_interval: Duration,
    /// Keys the database accepts from remote peers (`None` = unbounded).
    pub max_database_keys: Option<usize>,
    /// Values per key the database accepts from remote peers (`None` = unbounded).
    pub max_values_per_key: Option<usize>,

    // ========================================================================
    // Bootstrap and node discovery
    // ========================================================================
    pub bootstrap_hint_capacity: usize,
    /// Static fallback hosts; the first four bits of the local id choose one.
    pub fallback_hosts: Vec<SocketAddr>,
    pub node_adder_capacity: usize,
    pub node_adder_interval: Duration,

    // ========================================================================
    // Lifecycle and persistence
    // ========================================================================
    pub bind_addr: SocketAddr,
    /// Start even if the host overlay is not connected or not DHT-capable.
    pub force_connect: bool,
    /// Directory holding persisted state; `None` disables persistence.
    pub persist_dir: Option<PathBuf>,
    /// Snapshots written with another version are discarded on load.
    pub snapshot_version: u32,
    pub max_persisted_nodes: usize,
    pub min_persisted_nodes: usize,
    pub stop_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            cache_size: DEFAULT_K,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,

            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_max_errors: DEFAULT_LOOKUP_MAX_ERRORS,
            ping_max_errors: DEFAULT_PING_MAX_ERRORS,
            store_max_errors: DEFAULT_STORE_MAX_ERRORS,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            boost_frequency: DEFAULT_BOOST_FREQUENCY,
            boost_timeout: DEFAULT_BOOST_TIMEOUT,
            accept_empty_find_node_responses: true,

            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            value_ttl: DEFAULT_VALUE_TTL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            republish_check_interval: DEFAULT_REPUBLISH_CHECK_INTERVAL,
            max_database_keys: None,
            max_values_per_key: None,

            bootstrap_hint_capacity: DEFAULT_BOOTSTRAP_HINT_CAPACITY,
            fallback_hosts: Vec::new(),
            node_adder_capacity: DEFAULT_NODE_ADDER_CAPACITY,
            node_adder_interval: DEFAULT_NODE_ADDER_INTERVAL,

            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            force_connect: false,
            persist_dir: None,
            snapshot_version: 0,
            max_persisted_nodes: DEFAULT_MAX_PERSISTED_NODES,
            min_persisted_nodes: DEFAULT_MIN_PERSISTED_NODES,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl DhtConfig {
    /// Alpha clamped to at least one in-flight request.
    pub fn effective_alpha(&self) -> usize {
        self.alpha.max(1)
    }

    /// K clamped to at least one contact.
    pub fn effective_k(&self) -> usize {
        self.k.max(1)
    }

    /// Timers shortened so in-process tests finish quickly.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(5),
            boost_frequency: Duration::from_millis(50),
            boost_timeout: Duration::from_millis(150),
            republish_check_interval: Duration::from_secs(3600),
            bucket_refresh_interval: Duration::from_secs(3600),
            node_adder_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            force_connect: true,
            ..Self::default()
        }
    }
}
