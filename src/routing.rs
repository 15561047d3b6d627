//! # Routing Table
//!
//! Prefix-partitioned Kademlia routing table.
//!
//! The table starts as a single bucket covering the whole id space. A full
//! bucket splits in two only while it covers the local id's own prefix
//! region; every other bucket keeps a fixed size of `k` live contacts and
//! parks newcomers in a bounded replacement cache.
//!
//! ## Bucket Layout
//!
//! ```text
//! depth 1   [1...]              covers half the space, never splits
//! depth 2   [01..]              never splits
//! depth 3   [001.]              never splits
//! depth 3   [000.] <- local id  splits again when full
//! ```
//!
//! Each bucket holds:
//! - `live`: at most `k` contacts, least-recently-seen first
//! - `cache`: replacement candidates, least-recently-seen first
//!
//! ## Eviction
//!
//! A live contact leaves its bucket only once its consecutive failure count
//! reaches the dead threshold, and only when something can take its place:
//! either a new contact arriving at a full bucket or the most recently seen
//! cache entry, promoted on failure. Pinned leaves (directly connected peers)
//! are never evicted by failures.
//!
//! ## Concurrency
//!
//! The table is a plain value owned by the DHT actor. Every mutation arrives
//! through the actor's command queue, so operations on a bucket never
//! interleave and enumerations always observe a consistent snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::{Contact, ID_BITS, ID_LEN, Identity, common_prefix_len, distance_cmp, now_ms};

/// Outcome of [`RoutingTable::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New contact entered a live list.
    Inserted,
    /// Known contact refreshed in place.
    Updated,
    /// A dead live contact was evicted to make room.
    Replaced { evicted: Contact },
    /// The bucket is full; the contact waits in the cache. `probe` is the
    /// least-recently-seen live contact, which should be pinged so a dead
    /// entry is eventually noticed and replaced.
    CachedAsReplacement { probe: Option<Contact> },
    /// Bucket and cache are both full.
    RejectedFull,
    /// The contact carries the local node's id.
    RejectedSelf,
}

/// Which sub-lists [`RoutingTable::select`] draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Live contacts that have not failed since they were last seen.
    Live,
    /// Live and cached contacts that are not dead.
    All,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    prefix: Identity,
    depth: usize,
    live: Vec<Contact>,
    cache: Vec<Contact>,
    last_refresh: Instant,
}

impl Bucket {
    fn new(prefix: Identity, depth: usize) -> Self {
        Self {
            prefix,
            depth,
            live: Vec::new(),
            cache: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    /// Identifier whose first `depth` bits define this bucket.
    pub fn prefix(&self) -> Identity {
        self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Live contacts, least recently seen first.
    pub fn live(&self) -> &[Contact] {
        &self.live
    }

    /// Replacement candidates, least recently seen first.
    pub fn cache(&self) -> &[Contact] {
        &self.cache
    }

    pub fn contains(&self, id: &Identity) -> bool {
        common_prefix_len(&self.prefix, id) >= self.depth
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn live_position(&self, id: &Identity) -> Option<usize> {
        self.live.iter().position(|c| &c.identity == id)
    }

    fn cache_position(&self, id: &Identity) -> Option<usize> {
        self.cache.iter().position(|c| &c.identity == id)
    }

    /// Split into the `0` and `1` children at bit `depth`.
    fn split(self) -> (Bucket, Bucket) {
        let mut right_prefix = *self.prefix.as_bytes();
        right_prefix[self.depth / 8] |= 0x80 >> (self.depth % 8);
        let mut left_prefix = *self.prefix.as_bytes();
        left_prefix[self.depth / 8] &= !(0x80 >> (self.depth % 8));

        let mut left = Bucket::new(Identity::from_bytes(left_prefix), self.depth + 1);
        let mut right = Bucket::new(Identity::from_bytes(right_prefix), self.depth + 1);
        for contact in self.live {
            if contact.identity.bit(self.depth) {
                right.live.push(contact);
            } else {
                left.live.push(contact);
            }
        }
        for contact in self.cache {
            if contact.identity.bit(self.depth) {
                right.cache.push(contact);
            } else {
                left.cache.push(contact);
            }
        }
        left.last_refresh = self.last_refresh;
        right.last_refresh = self.last_refresh;
        (left, right)
    }

    /// A random id inside this bucket's range.
    pub fn random_id(&self) -> Identity {
        let mut bytes = [0u8; ID_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            bytes = *Identity::random().as_bytes();
        }
        let prefix = self.prefix.as_bytes();
        let full_bytes = self.depth / 8;
        bytes[..full_bytes].copy_from_slice(&prefix[..full_bytes]);
        let rem = self.depth % 8;
        if rem > 0 {
            let mask = 0xFFu8 << (8 - rem);
            bytes[full_bytes] = (prefix[full_bytes] & mask) | (bytes[full_bytes] & !mask);
        }
        Identity::from_bytes(bytes)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: Identity,
    k: usize,
    cache_size: usize,
    dead_threshold: u32,
    buckets: Vec<Bucket>,
    /// Pinned leaves by address.
    pinned: HashMap<SocketAddr, Identity>,
}

impl RoutingTable {
    pub fn new(local_id: Identity, k: usize, cache_size: usize, dead_threshold: u32) -> Self {
        Self {
            local_id,
            k: k.max(1),
            cache_size,
            dead_threshold: dead_threshold.max(1),
            buckets: vec![Bucket::new(Identity::from_bytes([0u8; ID_LEN]), 0)],
            pinned: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> Identity {
        self.local_id
    }

    fn bucket_index(&self, id: &Identity) -> usize {
        // Buckets partition the id space, so exactly one matches.
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .unwrap_or(0)
    }

    fn is_splittable(&self, bucket: &Bucket) -> bool {
        bucket.depth < ID_BITS && bucket.contains(&self.local_id)
    }

    /// Insert or refresh a contact.
    ///
    /// `is_live` marks a contact observed directly (it just talked to us);
    /// contacts learned second-hand from responses pass `false` and keep
    /// their reported `last_seen`.
    pub fn add(&mut self, contact: Contact, is_live: bool) -> AddOutcome {
        if contact.identity == self.local_id {
            return AddOutcome::RejectedSelf;
        }

        let now = now_ms();
        loop {
            let idx = self.bucket_index(&contact.identity);
            let k = self.k;
            let dead_threshold = self.dead_threshold;
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.live_position(&contact.identity) {
                let mut existing = bucket.live.remove(pos);
                if existing.addr != contact.addr {
                    if existing.failures == 0 && !existing.is_pinned() {
                        // Healthy entry keeps its address; a changed address
                        // has to prove itself by outliving the old one.
                        debug!(
                            id = %contact.identity.short(),
                            known = %existing.addr,
                            claimed = %contact.addr,
                            "ignoring address change for a healthy contact"
                        );
                    } else {
                        existing.addr = contact.addr;
                    }
                }
                existing.firewalled = contact.firewalled;
                if is_live {
                    existing.mark_alive(now);
                } else if !existing.is_pinned() {
                    existing.last_seen = existing.last_seen.max(contact.last_seen.min(now));
                }
                bucket.live.push(existing);
                if is_live {
                    bucket.mark_refreshed();
                }
                return AddOutcome::Updated;
            }

            if let Some(pos) = bucket.cache_position(&contact.identity) {
                let mut existing = bucket.cache.remove(pos);
                existing.addr = contact.addr;
                if is_live {
                    existing.mark_alive(now);
                }
                if bucket.live.len() < k {
                    bucket.live.push(existing);
                    bucket.mark_refreshed();
                    return AddOutcome::Inserted;
                }
                bucket.cache.push(existing);
                let probe = bucket.live.iter().find(|c| !c.is_pinned()).cloned();
                return AddOutcome::CachedAsReplacement { probe };
            }

            // Reported liveness is never trusted beyond the present.
            let mut fresh = contact.clone();
            fresh.failures = 0;
            fresh.last_seen = fresh.last_seen.min(now);
            if is_live {
                fresh.mark_alive(now);
            }

            if bucket.live.len() < k {
                bucket.live.push(fresh);
                bucket.mark_refreshed();
                return AddOutcome::Inserted;
            }

            if self.is_splittable(&self.buckets[idx]) {
                self.split_bucket(idx);
                continue;
            }

            let bucket = &mut self.buckets[idx];

            // Oldest dead, unpinned live contact makes room.
            if let Some(pos) = bucket
                .live
                .iter()
                .position(|c| !c.is_pinned() && c.is_dead(dead_threshold))
            {
                let evicted = bucket.live.remove(pos);
                bucket.live.push(fresh);
                bucket.mark_refreshed();
                trace!(
                    evicted = %evicted.identity.short(),
                    inserted = %contact.identity.short(),
                    "replaced dead contact"
                );
                return AddOutcome::Replaced { evicted };
            }

            if bucket.cache.len() >= self.cache_size {
                if let Some(pos) = bucket.cache.iter().position(|c| c.is_dead(dead_threshold)) {
                    bucket.cache.remove(pos);
                } else if is_live && !bucket.cache.is_empty() {
                    bucket.cache.remove(0);
                } else {
                    return AddOutcome::RejectedFull;
                }
            }
            if self.cache_size == 0 {
                return AddOutcome::RejectedFull;
            }
            bucket.cache.push(fresh);
            let probe = bucket.live.iter().find(|c| !c.is_pinned()).cloned();
            return AddOutcome::CachedAsReplacement { probe };
        }
    }

    fn split_bucket(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let depth = bucket.depth;
        let (left, right) = bucket.split();
        trace!(depth = depth + 1, left = left.live.len(), right = right.live.len(), "split bucket");
        self.buckets.insert(idx, right);
        self.buckets.insert(idx, left);
    }

    /// Count a failure against `id`. Unknown ids are ignored.
    ///
    /// Returns the contact that was evicted, if the failure pushed a live
    /// contact over the threshold and a cached replacement took its place.
    pub fn handle_failure(&mut self, id: &Identity) -> Option<Contact> {
        let dead_threshold = self.dead_threshold;
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.live_position(id) {
            let contact = &mut bucket.live[pos];
            contact.failures = contact.failures.saturating_add(1);
            if contact.is_pinned() || !contact.is_dead(dead_threshold) {
                return None;
            }
            let replacement = bucket.cache.pop()?;
            let evicted = bucket.live.remove(pos);
            debug!(
                evicted = %evicted.identity.short(),
                promoted = %replacement.identity.short(),
                "promoted cached contact over dead one"
            );
            bucket.live.push(replacement);
            return Some(evicted);
        }

        if let Some(pos) = bucket.cache_position(id) {
            let contact = &mut bucket.cache[pos];
            contact.failures = contact.failures.saturating_add(1);
            if contact.is_dead(dead_threshold) {
                return Some(bucket.cache.remove(pos));
            }
        }
        None
    }

    /// Feed back the result of probing a least-recently-seen contact.
    pub fn apply_probe_result(&mut self, probe: &Contact, alive: bool) {
        if alive {
            let _ = self.add(probe.clone(), true);
        } else {
            let _ = self.handle_failure(&probe.identity);
        }
    }

    /// Up to `count` contacts ordered by distance to `key`, closest first.
    ///
    /// Pinned leaves inside the bucket covering `key` are returned ahead of
    /// everything else, so a directly connected peer is always the first hop
    /// for keys in its region.
    pub fn select(&self, key: &Identity, count: usize, mode: SelectMode) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<&Contact> = Vec::new();
        for bucket in &self.buckets {
            match mode {
                SelectMode::Live => {
                    candidates.extend(bucket.live.iter().filter(|c| c.failures == 0 || c.is_pinned()));
                }
                SelectMode::All => {
                    candidates.extend(
                        bucket
                            .live
                            .iter()
                            .chain(bucket.cache.iter())
                            .filter(|c| c.is_pinned() || !c.is_dead(self.dead_threshold)),
                    );
                }
            }
        }

        candidates.sort_by(|a, b| distance_cmp(&a.identity.xor_distance(key), &b.identity.xor_distance(key)));

        if !self.pinned.is_empty() {
            let home = &self.buckets[self.bucket_index(key)];
            let (first, rest): (Vec<&Contact>, Vec<&Contact>) = candidates
                .into_iter()
                .partition(|c| c.is_pinned() && home.contains(&c.identity));
            candidates = first.into_iter().chain(rest).collect();
        }

        candidates.into_iter().take(count).cloned().collect()
    }

    pub fn get(&self, id: &Identity) -> Option<&Contact> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket
            .live
            .iter()
            .chain(bucket.cache.iter())
            .find(|c| &c.identity == id)
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.get(id).is_some()
    }

    /// All buckets, ordered by prefix.
    pub fn all_buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Every live contact in the table.
    pub fn all_nodes(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.live.iter().cloned()).collect()
    }

    /// Number of live contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Healthy live contacts, most recently seen first.
    pub fn mrs_contacts(&self, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|c| !c.is_dead(self.dead_threshold))
            .cloned()
            .collect();
        contacts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        contacts.truncate(count);
        contacts
    }

    // ========================================================================
    // Pinned leaves
    // ========================================================================

    /// Insert a probed, directly connected contact with maximal recency.
    ///
    /// A full bucket that cannot split demotes its least-recently-seen
    /// unpinned contact to the cache to make room.
    pub fn add_pinned_leaf(&mut self, contact: Contact) -> AddOutcome {
        if contact.identity == self.local_id {
            return AddOutcome::RejectedSelf;
        }
        if self.pinned.get(&contact.addr).is_some_and(|id| *id != contact.identity) {
            // Same leaf connection, new identity: the old entry is stale.
            self.remove_pinned_leaf(&contact.addr);
        }
        let mut pinned = contact;
        pinned.failures = 0;
        pinned.last_seen = u64::MAX;

        let k = self.k;
        let cache_size = self.cache_size;
        loop {
            let idx = self.bucket_index(&pinned.identity);
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.live_position(&pinned.identity) {
                bucket.live.remove(pos);
            } else if let Some(pos) = bucket.cache_position(&pinned.identity) {
                bucket.cache.remove(pos);
            }

            if bucket.live.len() < k {
                bucket.live.push(pinned.clone());
                bucket.mark_refreshed();
                self.pinned.insert(pinned.addr, pinned.identity);
                return AddOutcome::Inserted;
            }

            if self.is_splittable(&self.buckets[idx]) {
                self.split_bucket(idx);
                continue;
            }

            let bucket = &mut self.buckets[idx];
            let Some(pos) = bucket.live.iter().position(|c| !c.is_pinned()) else {
                return AddOutcome::RejectedFull;
            };
            let demoted = bucket.live.remove(pos);
            if cache_size > 0 {
                if bucket.cache.len() >= cache_size {
                    bucket.cache.remove(0);
                }
                bucket.cache.push(demoted.clone());
            }
            bucket.live.push(pinned.clone());
            bucket.mark_refreshed();
            self.pinned.insert(pinned.addr, pinned.identity);
            return AddOutcome::Replaced { evicted: demoted };
        }
    }

    /// Remove the pinned leaf at `addr` and promote the bucket's most
    /// recently seen cached contact in its place.
    pub fn remove_pinned_leaf(&mut self, addr: &SocketAddr) -> Option<Contact> {
        let id = self.pinned.remove(addr)?;
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.live_position(&id)?;
        let removed = bucket.live.remove(pos);
        if let Some(replacement) = bucket.cache.pop() {
            bucket.live.push(replacement);
        }
        Some(removed)
    }

    /// Pinned leaf contacts.
    pub fn pinned_leaves(&self) -> Vec<Contact> {
        self.pinned
            .values()
            .filter_map(|id| self.get(id))
            .filter(|c| c.is_pinned())
            .cloned()
            .collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// A random lookup target inside every non-empty bucket idle for longer
    /// than `threshold`.
    pub fn stale_refresh_targets(&self, threshold: Duration) -> Vec<Identity> {
        self.buckets
            .iter()
            .filter(|b| !b.live.is_empty() && b.is_stale(threshold))
            .map(Bucket::random_id)
            .collect()
    }

    /// Reset the refresh timer of the bucket covering `id`.
    pub fn mark_refreshed(&mut self, id: &Identity) {
        let idx = self.bucket_index(id);
        self.buckets[idx].mark_refreshed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::is_closer;
    use rand::Rng;
    use std::collections::HashSet;

    const K: usize = 4;

    fn local() -> Identity {
        Identity::from_bytes([0u8; ID_LEN])
    }

    fn contact_with(bytes: [u8; ID_LEN], port: u16) -> Contact {
        Contact::seen_now(Identity::from_bytes(bytes), SocketAddr::from(([10, 0, 0, 1], port)))
    }

    /// A contact in the far half of the space (first bit set), never splittable.
    fn far(n: u8) -> Contact {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 0x80;
        bytes[ID_LEN - 1] = n;
        contact_with(bytes, 5000 + n as u16)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(local(), K, 2, 2)
    }

    /// Fill the far half with `K` contacts and force the initial split with
    /// one near contact, leaving the far bucket full with an empty cache.
    fn fill_far_bucket(table: &mut RoutingTable) {
        for n in 0..K as u8 {
            table.add(far(n), true);
        }
        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        table.add(contact_with(near, 4999), true);
        assert_eq!(table.all_buckets().len(), 2);
    }

    #[test]
    fn self_is_rejected() {
        let mut table = table();
        let me = Contact::seen_now(local(), "10.0.0.1:4000".parse().unwrap());
        assert_eq!(table.add(me, true), AddOutcome::RejectedSelf);
        assert!(table.is_empty());
    }

    #[test]
    fn bucket_covering_local_id_splits() {
        let mut table = table();
        for n in 0..K as u8 {
            assert_eq!(table.add(far(n), true), AddOutcome::Inserted);
        }
        assert_eq!(table.all_buckets().len(), 1);

        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        assert_eq!(table.add(contact_with(near, 6000), true), AddOutcome::Inserted);
        assert!(table.all_buckets().len() >= 2);
        for bucket in table.all_buckets() {
            assert!(bucket.live().len() <= K);
            for c in bucket.live() {
                assert!(bucket.contains(&c.identity));
            }
        }
    }

    #[test]
    fn distant_full_bucket_caches_and_probes_oldest() {
        let mut table = table();
        fill_far_bucket(&mut table);
        let outcome = table.add(far(50), true);
        match outcome {
            AddOutcome::CachedAsReplacement { probe: Some(probe) } => {
                assert_eq!(probe.identity, far(0).identity);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!table.all_nodes().iter().any(|c| c.identity == far(50).identity));
        assert!(table.contains(&far(50).identity));
    }

    #[test]
    fn full_cache_rejects_second_hand_contacts() {
        let mut table = table();
        fill_far_bucket(&mut table);
        table.add(far(50), true);
        table.add(far(51), true);
        assert_eq!(table.add(far(52), false), AddOutcome::RejectedFull);
        // A live sighting still displaces the oldest cached entry.
        assert!(matches!(table.add(far(53), true), AddOutcome::CachedAsReplacement { .. }));
    }

    #[test]
    fn dead_contact_is_replaced_by_newcomer() {
        let mut table = table();
        fill_far_bucket(&mut table);
        let victim = far(1).identity;
        table.handle_failure(&victim);
        table.handle_failure(&victim);
        match table.add(far(60), true) {
            AddOutcome::Replaced { evicted } => assert_eq!(evicted.identity, victim),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!table.contains(&victim));
    }

    #[test]
    fn failure_promotes_most_recent_cached_contact() {
        let mut table = table();
        fill_far_bucket(&mut table);
        table.add(far(70), true);
        table.add(far(71), true);

        let victim = far(2).identity;
        assert!(table.handle_failure(&victim).is_none());
        let evicted = table.handle_failure(&victim).expect("evicted on threshold");
        assert_eq!(evicted.identity, victim);
        let live: Vec<Identity> = table.all_nodes().iter().map(|c| c.identity).collect();
        assert!(live.contains(&far(71).identity));
        assert!(!live.contains(&far(70).identity));
    }

    #[test]
    fn failure_for_unknown_id_is_ignored() {
        let mut table = table();
        table.add(far(1), true);
        assert!(table.handle_failure(&far(9).identity).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn probe_result_feeds_back() {
        let mut table = table();
        fill_far_bucket(&mut table);
        let probe = far(0);
        table.apply_probe_result(&probe, false);
        assert_eq!(table.get(&probe.identity).map(|c| c.failures), Some(1));
        table.apply_probe_result(&probe, true);
        assert_eq!(table.get(&probe.identity).map(|c| c.failures), Some(0));
    }

    #[test]
    fn healthy_contact_keeps_its_address() {
        let mut table = table();
        let original = far(3);
        table.add(original.clone(), true);
        let mut moved = original.clone();
        moved.addr = "10.9.9.9:1".parse().unwrap();
        assert_eq!(table.add(moved.clone(), true), AddOutcome::Updated);
        assert_eq!(table.get(&original.identity).map(|c| c.addr), Some(original.addr));

        table.handle_failure(&original.identity);
        table.add(moved.clone(), true);
        assert_eq!(table.get(&original.identity).map(|c| c.addr), Some(moved.addr));
    }

    #[test]
    fn random_operations_preserve_invariants() {
        let mut rng = rand::thread_rng();
        let local_id = Identity::random();
        let mut table = RoutingTable::new(local_id, K, 3, 2);
        let mut known = Vec::new();

        for step in 0..2000u32 {
            if step % 3 == 0 && !known.is_empty() {
                let id: Identity = known[rng.gen_range(0..known.len())];
                table.handle_failure(&id);
            } else {
                let id = Identity::random();
                known.push(id);
                let port = 1000 + (step % 60000) as u16;
                table.add(Contact::seen_now(id, SocketAddr::from(([10, 1, 2, 3], port))), rng.gen_bool(0.5));
            }

            let mut seen = HashSet::new();
            for bucket in table.all_buckets() {
                assert!(bucket.live().len() <= K);
                for c in bucket.live().iter().chain(bucket.cache().iter()) {
                    assert!(seen.insert(c.identity), "duplicate id in table");
                    assert!(bucket.contains(&c.identity));
                    assert_ne!(c.identity, local_id);
                }
            }
        }

        let target = Identity::random();
        let selected = table.select(&target, K * 3, SelectMode::Live);
        for pair in selected.windows(2) {
            assert!(is_closer(&pair[0].identity, &pair[1].identity, &target));
        }
        assert!(selected.iter().all(|c| c.failures == 0));
    }

    #[test]
    fn buckets_cover_the_space_disjointly() {
        let mut table = RoutingTable::new(Identity::random(), 2, 1, 2);
        for _ in 0..300 {
            table.add(Contact::seen_now(Identity::random(), "10.0.0.1:4000".parse().unwrap()), true);
        }
        for _ in 0..200 {
            let probe = Identity::random();
            let owners = table.all_buckets().iter().filter(|b| b.contains(&probe)).count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn random_id_lands_in_its_bucket() {
        let mut table = RoutingTable::new(Identity::random(), 2, 1, 2);
        for _ in 0..200 {
            table.add(Contact::seen_now(Identity::random(), "10.0.0.1:4000".parse().unwrap()), true);
        }
        for bucket in table.all_buckets() {
            for _ in 0..8 {
                assert!(bucket.contains(&bucket.random_id()));
            }
        }
    }

    #[test]
    fn pinned_leaf_is_selected_ahead_of_closer_contact() {
        let mut table = table();
        let mut closer_bytes = [0u8; ID_LEN];
        closer_bytes[0] = 0x80;
        closer_bytes[ID_LEN - 1] = 0x01;
        let closer = contact_with(closer_bytes, 7001);
        let mut leaf_bytes = [0u8; ID_LEN];
        leaf_bytes[0] = 0x80;
        leaf_bytes[ID_LEN - 1] = 0x0F;
        let mut leaf = contact_with(leaf_bytes, 7002);
        leaf.last_seen = 1;

        table.add(closer.clone(), true);
        assert_eq!(table.add_pinned_leaf(leaf.clone()), AddOutcome::Inserted);

        let key = Identity::from_bytes(closer_bytes);
        let selected = table.select(&key, 2, SelectMode::Live);
        assert_eq!(selected[0].identity, leaf.identity);
        assert!(selected[0].is_pinned());
        assert_eq!(selected[1].identity, closer.identity);
        assert_eq!(table.pinned_leaves().len(), 1);
    }

    #[test]
    fn pinned_leaf_survives_failures() {
        let mut table = table();
        fill_far_bucket(&mut table);
        table.add(far(90), true);
        let leaf = far(91);
        table.add_pinned_leaf(leaf.clone());
        for _ in 0..10 {
            table.handle_failure(&leaf.identity);
        }
        assert!(table.all_nodes().iter().any(|c| c.identity == leaf.identity));
    }

    #[test]
    fn removing_pinned_leaf_promotes_cache() {
        let mut table = table();
        fill_far_bucket(&mut table);
        let leaf = far(80);
        assert!(matches!(table.add_pinned_leaf(leaf.clone()), AddOutcome::Replaced { .. }));
        table.add(far(81), true);

        let removed = table.remove_pinned_leaf(&leaf.addr).expect("leaf was pinned");
        assert_eq!(removed.identity, leaf.identity);
        assert!(!table.contains(&leaf.identity));
        assert!(table.all_nodes().iter().any(|c| c.identity == far(81).identity));
        assert!(table.remove_pinned_leaf(&leaf.addr).is_none());
    }

    #[test]
    fn repinning_an_address_replaces_the_old_identity() {
        let mut table = table();
        let first = far(70);
        let mut second = far(71);
        second.addr = first.addr;

        table.add_pinned_leaf(first.clone());
        table.add_pinned_leaf(second.clone());

        assert!(!table.contains(&first.identity));
        let leaves = table.pinned_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].identity, second.identity);
    }

    #[test]
    fn mrs_contacts_are_most_recent_first() {
        let mut table = table();
        for n in 0..3u8 {
            let mut c = far(n);
            c.last_seen = 100 + n as u64;
            table.add(c, false);
        }
        let mrs = table.mrs_contacts(2);
        assert_eq!(mrs.len(), 2);
        assert_eq!(mrs[0].identity, far(2).identity);
        assert_eq!(mrs[1].identity, far(1).identity);
    }
}
