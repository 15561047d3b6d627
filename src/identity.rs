//! # Identifiers, Distance and Contacts
//!
//! - [`Identity`]: 160-bit opaque identifier used for both node ids and value keys
//! - [`Key`]: alias of [`Identity`] used where the id names a value
//! - [`Contact`]: a remote participant (id, address and liveness metadata)
//!
//! ## Distance Model
//!
//! Distance between two ids is their bitwise XOR interpreted as an unsigned
//! big-endian integer. For a fixed reference id XOR is a bijection, so two
//! distinct ids never share a distance: [`is_closer`] is a strict total order.
//!
//! | Function | Meaning |
//! |----------|---------|
//! | [`Identity::xor_distance`] | `a ^ b` as raw bytes |
//! | [`distance_cmp`] | big-endian comparison of two distances |
//! | [`is_closer`] | `xor(candidate, ref) < xor(other, ref)` |
//! | [`common_prefix_len`] | number of leading bits two ids share |

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::DhtError;

/// Identifier width in bytes.
pub const ID_LEN: usize = 20;

/// Identifier width in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// Raw XOR distance between two identifiers.
pub type Distance = [u8; ID_LEN];

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; ID_LEN]);

/// Value keys share the identifier space with node ids.
pub type Key = Identity;

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from untrusted byte material.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DhtError> {
        let array: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| DhtError::InvalidIdentifier { len: bytes.len() })?;
        Ok(Self(array))
    }

    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s).map_err(|_| DhtError::InvalidIdentifier { len: s.len() / 2 })?;
        Self::from_slice(&bytes)
    }

    /// A fresh identifier from the OS random source.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Content key: the blake3 digest of `data`, truncated to 160 bits.
    pub fn from_content(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Value of bit `index`, counting from the most significant bit.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

/// Big-endian comparison of two distances.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    for i in 0..ID_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// True iff `candidate` is strictly closer to `reference` than `other` is.
#[inline]
pub fn is_closer(candidate: &Identity, other: &Identity, reference: &Identity) -> bool {
    distance_cmp(
        &candidate.xor_distance(reference),
        &other.xor_distance(reference),
    ) == std::cmp::Ordering::Less
}

/// Number of leading bits `a` and `b` have in common (160 when equal).
pub fn common_prefix_len(a: &Identity, b: &Identity) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Identity {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; ID_LEN]> for Identity {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; ID_LEN] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Liveness classification derived from a contact's failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// Responded since the last failure.
    Alive,
    /// Failed at least once but is still below the dead threshold.
    Unknown,
    /// Failure count reached the threshold; eligible for eviction.
    Dead,
}

/// A remote participant.
///
/// The routing table holds the authoritative copy; lookups and responses
/// carry clones and never feed liveness back except through the table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addr: SocketAddr,
    /// Unix-ms of the last observed liveness event (0 = never, `u64::MAX` = pinned).
    pub last_seen: u64,
    /// Consecutive failures since the contact was last seen alive.
    pub failures: u32,
    /// Firewalled contacts answer nothing unsolicited and are kept out of routing tables.
    #[serde(default)]
    pub firewalled: bool,
}

impl Contact {
    pub fn new(identity: Identity, addr: SocketAddr) -> Self {
        Self {
            identity,
            addr,
            last_seen: 0,
            failures: 0,
            firewalled: false,
        }
    }

    /// A contact observed alive right now.
    pub fn seen_now(identity: Identity, addr: SocketAddr) -> Self {
        let mut contact = Self::new(identity, addr);
        contact.last_seen = now_ms();
        contact
    }

    pub fn with_firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    pub fn state(&self, dead_threshold: u32) -> ContactState {
        if self.failures == 0 {
            ContactState::Alive
        } else if self.failures >= dead_threshold {
            ContactState::Dead
        } else {
            ContactState::Unknown
        }
    }

    pub fn is_dead(&self, dead_threshold: u32) -> bool {
        self.state(dead_threshold) == ContactState::Dead
    }

    pub fn is_pinned(&self) -> bool {
        self.last_seen == u64::MAX
    }

    /// Record a liveness event. Pinned contacts keep their maximal recency.
    pub(crate) fn mark_alive(&mut self, now: u64) {
        self.failures = 0;
        if !self.is_pinned() {
            self.last_seen = self.last_seen.max(now);
        }
    }

    /// Addresses we can never talk to (port 0, unspecified or broadcast hosts).
    pub fn has_routable_addr(&self) -> bool {
        if self.addr.port() == 0 || self.addr.ip().is_unspecified() {
            return false;
        }
        match self.addr.ip() {
            std::net::IpAddr::V4(ip) => !ip.is_broadcast() && !ip.is_multicast(),
            std::net::IpAddr::V6(ip) => !ip.is_multicast(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.addr == other.addr
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.addr.hash(state);
    }
}
