//! # Value Storage
//!
//! The local value database and its expiry and republish policy.
//!
//! Values are grouped into bags by primary key; inside a bag each value is
//! identified by its secondary key (by default the originator's id), so the
//! pair `(primary_key, secondary_key)` is unique.
//!
//! ## Store Rules
//!
//! | Situation | Result |
//! |-----------|--------|
//! | payload larger than `MAX_VALUE_SIZE` | rejected |
//! | remote copy of a locally originated value | rejected |
//! | empty payload | removes the sender's value |
//! | new key/value beyond the configured limits | rejected |
//! | otherwise | inserted or overwritten |
//!
//! ## Expiry
//!
//! Values expire `value_ttl` after they were created or last published.
//! Locally originated push-proxy records are the exception: they live as long
//! as the local proxy set they describe is current, re-checked every sweep.
//!
//! ## Republishing
//!
//! | Role | Value | Republished when |
//! |------|-------|------------------|
//! | active/passive | local original | due by age (location values only while rare) |
//! | passive | held for a leaf | once, then dropped after it was published |
//! | active | held for others | never (the originator republishes) |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::host::DhtMode;
use crate::identity::{Key, now_ms};
use crate::messages::{DhtValue, MAX_VALUE_SIZE, StoreCode, ValueType};

/// A stored value plus local bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEntity {
    pub value: DhtValue,
    /// Published by this node's own logic rather than received from a peer.
    pub is_local_original: bool,
    /// Unix ms.
    pub created_at: u64,
    pub last_published_at: Option<u64>,
    pub publish_count: u32,
}

impl ValueEntity {
    fn new(value: DhtValue, is_local_original: bool, now: u64) -> Self {
        Self {
            value,
            is_local_original,
            created_at: now,
            last_published_at: None,
            publish_count: 0,
        }
    }

    /// Timestamp the TTL counts from.
    fn freshness(&self) -> u64 {
        self.created_at.max(self.last_published_at.unwrap_or(0))
    }

    pub fn primary_key(&self) -> Key {
        self.value.primary_key
    }

    pub fn secondary_key(&self) -> Key {
        self.value.secondary_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreRejection {
    ValueTooLarge,
    LocalOriginal,
    TooManyKeys,
    TooManyValues,
}

#[derive(Debug)]
pub struct Database {
    bags: HashMap<Key, HashMap<Key, ValueEntity>>,
    max_keys: Option<usize>,
    max_values_per_key: Option<usize>,
    value_ttl: Duration,
}

impl Database {
    pub fn new(value_ttl: Duration, max_keys: Option<usize>, max_values_per_key: Option<usize>) -> Self {
        Self {
            bags: HashMap::new(),
            max_keys,
            max_values_per_key,
            value_ttl,
        }
    }

    /// Store a value. `is_local` marks values published by this node itself.
    pub fn store(&mut self, value: DhtValue, is_local: bool) -> StoreCode {
        match self.try_store(value, is_local, now_ms()) {
            Ok(()) => StoreCode::Stored,
            Err(_) => StoreCode::Rejected,
        }
    }

    fn try_store(&mut self, value: DhtValue, is_local: bool, now: u64) -> Result<(), StoreRejection> {
        let primary = value.primary_key;
        let secondary = value.secondary_key;

        if value.payload.len() > MAX_VALUE_SIZE {
            debug!(key = %primary.short(), size = value.payload.len(), "store rejected: value too large");
            return Err(StoreRejection::ValueTooLarge);
        }

        let existing = self
            .entity(&primary, &secondary)
            .map(|e| (e.is_local_original, e.value.originator.identity));
        if let Some((true, _)) = existing
            && !is_local
        {
            trace!(key = %primary.short(), "store rejected: would replace a local value");
            return Err(StoreRejection::LocalOriginal);
        }

        if value.is_removal() {
            if let Some((_, originator)) = existing
                && (is_local || originator == value.originator.identity)
            {
                self.remove(&primary, &secondary);
                trace!(key = %primary.short(), "value removed on request");
            }
            return Ok(());
        }

        if existing.is_none() && !is_local {
            let bag_len = self.bags.get(&primary).map(HashMap::len);
            if bag_len.is_none()
                && let Some(max) = self.max_keys
                && self.bags.len() >= max
            {
                debug!(key = %primary.short(), "store rejected: database full");
                return Err(StoreRejection::TooManyKeys);
            }
            if let Some(len) = bag_len
                && let Some(max) = self.max_values_per_key
                && len >= max
            {
                debug!(key = %primary.short(), "store rejected: key holds too many values");
                return Err(StoreRejection::TooManyValues);
            }
        }

        self.bags
            .entry(primary)
            .or_default()
            .insert(secondary, ValueEntity::new(value, is_local, now));
        Ok(())
    }

    /// Values under `key`, optionally restricted by secondary key and type.
    pub fn get(&self, key: &Key, secondary_keys: &[Key], value_type: Option<ValueType>) -> Vec<DhtValue> {
        let Some(bag) = self.bags.get(key) else {
            return Vec::new();
        };
        bag.values()
            .filter(|e| secondary_keys.is_empty() || secondary_keys.contains(&e.value.secondary_key))
            .filter(|e| value_type.is_none_or(|t| t == e.value.value_type))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Every secondary key held under `key`.
    pub fn available_keys(&self, key: &Key) -> Vec<Key> {
        self.bags
            .get(key)
            .map(|bag| bag.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn entity(&self, primary: &Key, secondary: &Key) -> Option<&ValueEntity> {
        self.bags.get(primary).and_then(|bag| bag.get(secondary))
    }

    pub fn remove(&mut self, primary: &Key, secondary: &Key) -> Option<ValueEntity> {
        let bag = self.bags.get_mut(primary)?;
        let removed = bag.remove(secondary);
        if bag.is_empty() {
            self.bags.remove(primary);
        }
        removed
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.bags.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.bags.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &ValueEntity> {
        self.bags.values().flat_map(|bag| bag.values())
    }

    /// Reinsert persisted entities as they were.
    pub fn restore(&mut self, entities: Vec<ValueEntity>) {
        for entity in entities {
            self.bags
                .entry(entity.value.primary_key)
                .or_default()
                .insert(entity.value.secondary_key, entity);
        }
    }

    // ========================================================================
    // Expiry and republishing
    // ========================================================================

    /// Drop expired values and return them.
    ///
    /// `proxy_current` decides the fate of locally originated push-proxy
    /// records, which are exempt from the TTL.
    pub fn expire(&mut self, now: u64, proxy_current: impl Fn(&Key) -> bool) -> Vec<ValueEntity> {
        let ttl = self.value_ttl.as_millis() as u64;
        let mut expired = Vec::new();
        for bag in self.bags.values_mut() {
            let doomed: Vec<Key> = bag
                .values()
                .filter(|e| {
                    if e.is_local_original && e.value.value_type == ValueType::PushProxy {
                        !proxy_current(&e.value.primary_key)
                    } else {
                        now >= e.freshness().saturating_add(ttl)
                    }
                })
                .map(|e| e.value.secondary_key)
                .collect();
            for secondary in doomed {
                if let Some(entity) = bag.remove(&secondary) {
                    expired.push(entity);
                }
            }
        }
        self.bags.retain(|_, bag| !bag.is_empty());
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stored values");
        }
        expired
    }

    /// Values due for republishing under `mode`.
    pub fn due_for_republish(
        &self,
        now: u64,
        republish_interval: Duration,
        mode: DhtMode,
        is_rare: impl Fn(&Key) -> bool,
    ) -> Vec<DhtValue> {
        let interval = republish_interval.as_millis() as u64;
        self.entities()
            .filter(|e| {
                if e.is_local_original {
                    let due = e
                        .last_published_at
                        .is_none_or(|at| now >= at.saturating_add(interval));
                    due && (e.value.value_type != ValueType::Location || is_rare(&e.value.primary_key))
                } else {
                    mode == DhtMode::Passive && e.publish_count == 0
                }
            })
            .map(|e| e.value.clone())
            .collect()
    }

    /// Record a completed publication.
    pub fn mark_published(&mut self, primary: &Key, secondary: &Key, now: u64) {
        if let Some(entity) = self.bags.get_mut(primary).and_then(|bag| bag.get_mut(secondary)) {
            entity.last_published_at = Some(now);
            entity.publish_count = entity.publish_count.saturating_add(1);
        }
    }

    /// Passive role: drop values held for others once they were published.
    pub fn sweep_relayed(&mut self) -> usize {
        let before = self.len();
        for bag in self.bags.values_mut() {
            bag.retain(|_, e| e.is_local_original || e.publish_count == 0);
        }
        self.bags.retain(|_, bag| !bag.is_empty());
        before - self.len()
    }
}
