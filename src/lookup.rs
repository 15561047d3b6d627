//! # Iterative Lookup
//!
//! FIND_NODE and FIND_VALUE convergence.
//!
//! [`LookupState`] is the pure state machine: a frontier of contacts still to
//! query ordered by distance to the target, the set of up to `k` closest
//! contacts that actually answered, and a history of every id seen so none is
//! queried twice. [`run`] drives it over a [`DhtNodeRpc`] with at most
//! `alpha` requests in flight.
//!
//! ## Termination
//!
//! A lookup ends when no request is in flight and the frontier holds nothing
//! closer than the worst of the `k` closest responders. A value lookup also
//! ends at the first response carrying values of the requested type.
//!
//! ## Boost
//!
//! If nothing has answered for `boost_timeout`, one extra request goes to the
//! next frontier contact even when `alpha` requests are already in flight.
//!
//! ## Validation
//!
//! Responses are checked before they touch any state. A responder or a
//! returned contact that claims the local id from another address, a
//! response of the wrong shape, or an empty FIND_NODE answer (when not
//! tolerated) is logged and treated as if the contact had not answered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::identity::{Contact, Distance, Identity, Key};
use crate::messages::{DhtRequest, DhtResponse, DhtValue, ValueType};
use crate::protocols::DhtNodeRpc;
use crate::rpc::{RpcOutcome, check_spoof, send_with_resend};

/// Hard cap on the number of contacts a single lookup will query.
const MAX_QUERIED_PER_LOOKUP: usize = 512;

/// Routing table feedback from a running lookup.
#[async_trait]
pub trait LookupObserver: Send + Sync + 'static {
    /// `contact` answered a request.
    async fn responded(&self, contact: Contact);

    /// Contacts learned second-hand from a response.
    async fn learned(&self, contacts: Vec<Contact>);

    /// `contact` timed out or failed.
    async fn failed(&self, contact: Contact);
}

/// Lookup counters reported with every result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Path depth from the seeds to the deepest member of the closest set.
    /// Seeds answering count as one hop.
    pub hops: usize,
    pub elapsed: Duration,
    pub queried: usize,
    pub responses: usize,
    pub errors: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Node { target: Key },
    Value { key: Key, value_type: Option<ValueType> },
}

impl LookupKind {
    pub fn target(&self) -> Key {
        match self {
            LookupKind::Node { target } => *target,
            LookupKind::Value { key, .. } => *key,
        }
    }

    fn request(&self) -> DhtRequest {
        match self {
            LookupKind::Node { target } => DhtRequest::FindNode { target: *target },
            LookupKind::Value { key, value_type } => DhtRequest::FindValue {
                key: *key,
                secondary_keys: Vec::new(),
                value_type: *value_type,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub enum LookupOutcome {
    Nodes {
        /// Responders closest to the target, closest first (local node excluded).
        closest: Vec<Contact>,
        /// The local node would rank among the `k` closest.
        includes_local: bool,
        stats: LookupStats,
    },
    Values {
        values: Vec<DhtValue>,
        /// Secondary keys the responder holds but did not return.
        remaining_keys: Vec<Key>,
        responder: Contact,
        stats: LookupStats,
    },
}

/// Lookup tunables taken from [`DhtConfig`].
#[derive(Clone, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    pub max_errors: usize,
    pub lookup_timeout: Duration,
    pub boost_frequency: Duration,
    pub boost_timeout: Duration,
    pub accept_empty_find_node_responses: bool,
}

impl From<&DhtConfig> for LookupParams {
    fn from(config: &DhtConfig) -> Self {
        Self {
            k: config.effective_k(),
            alpha: config.effective_alpha(),
            rpc_timeout: config.rpc_timeout,
            max_errors: config.lookup_max_errors,
            lookup_timeout: config.lookup_timeout,
            boost_frequency: config.boost_frequency,
            boost_timeout: config.boost_timeout,
            accept_empty_find_node_responses: config.accept_empty_find_node_responses,
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug)]
pub struct LookupState {
    target: Key,
    local: Contact,
    k: usize,
    /// Every id ever put on the frontier, with the hop it was learned at.
    history: HashMap<Identity, usize>,
    to_query: BTreeMap<Distance, Contact>,
    closest: BTreeMap<Distance, Contact>,
    in_flight: HashMap<Identity, Contact>,
    hops: usize,
    queried: usize,
    responses: usize,
    errors: usize,
    started: Instant,
    last_response: Instant,
}

impl LookupState {
    pub fn new(target: Key, local: Contact, k: usize, seeds: Vec<Contact>) -> Self {
        let now = Instant::now();
        let mut state = Self {
            target,
            local,
            k: k.max(1),
            history: HashMap::new(),
            to_query: BTreeMap::new(),
            closest: BTreeMap::new(),
            in_flight: HashMap::new(),
            hops: 0,
            queried: 0,
            responses: 0,
            errors: 0,
            started: now,
            last_response: now,
        };
        for seed in seeds {
            state.offer(seed, 0);
        }
        state
    }

    fn distance(&self, id: &Identity) -> Distance {
        id.xor_distance(&self.target)
    }

    /// Put a contact on the frontier unless it was seen before.
    fn offer(&mut self, contact: Contact, hop: usize) -> bool {
        if contact.identity == self.local.identity || self.history.contains_key(&contact.identity) {
            return false;
        }
        if !contact.has_routable_addr() || contact.firewalled {
            return false;
        }
        self.history.insert(contact.identity, hop);
        self.to_query.insert(self.distance(&contact.identity), contact);
        true
    }

    /// Distance of the worst closest responder once the set is full.
    fn bound(&self) -> Option<Distance> {
        if self.closest.len() < self.k {
            return None;
        }
        self.closest.keys().next_back().copied()
    }

    /// A frontier contact exists that could still improve the closest set.
    pub fn has_next(&self) -> bool {
        if self.queried >= MAX_QUERIED_PER_LOOKUP {
            return false;
        }
        match (self.to_query.keys().next(), self.bound()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(next), Some(bound)) => *next < bound,
        }
    }

    /// Take the closest worthwhile frontier contact and mark it in flight.
    pub fn next(&mut self) -> Option<Contact> {
        if !self.has_next() {
            return None;
        }
        let (_, contact) = self.to_query.pop_first()?;
        self.in_flight.insert(contact.identity, contact.clone());
        self.queried += 1;
        Some(contact)
    }

    /// Record an answer from `from` and merge the contacts it returned.
    /// Returns the contacts that were new to this lookup.
    pub fn on_response(&mut self, from: &Contact, contacts: Vec<Contact>) -> Vec<Contact> {
        self.in_flight.remove(&from.identity);
        self.responses += 1;
        self.last_response = Instant::now();

        let hop = self.history.get(&from.identity).copied().unwrap_or(0);
        let distance = self.distance(&from.identity);
        self.closest.insert(distance, from.clone());
        if self.closest.len() > self.k {
            self.closest.pop_last();
        }
        if self.closest.contains_key(&distance) {
            self.hops = self.hops.max(hop + 1);
        }

        contacts
            .into_iter()
            .filter(|c| self.offer(c.clone(), hop + 1))
            .collect()
    }

    /// Record that a queried contact produced no usable answer.
    pub fn on_failure(&mut self, id: &Identity) {
        if self.in_flight.remove(id).is_some() {
            self.errors += 1;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && !self.has_next()
    }

    /// Nothing has answered for `quiet`.
    pub fn should_boost(&self, quiet: Duration) -> bool {
        self.last_response.elapsed() >= quiet && self.has_next()
    }

    pub fn closest(&self) -> Vec<Contact> {
        self.closest.values().cloned().collect()
    }

    /// The local node ranks among the `k` closest known responders.
    pub fn includes_local(&self) -> bool {
        let local = self.distance(&self.local.identity);
        self.closest.len() < self.k || self.bound().is_some_and(|bound| local < bound)
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            hops: self.hops,
            elapsed: self.started.elapsed(),
            queried: self.queried,
            responses: self.responses,
            errors: self.errors,
        }
    }
}

// ============================================================================
// Async driver
// ============================================================================

type QueryResult = (Contact, RpcOutcome);

enum Verdict {
    Continue,
    Found(LookupOutcome),
}

/// Run a lookup to completion, cancellation or timeout.
pub async fn run<N: DhtNodeRpc>(
    network: Arc<N>,
    observer: Arc<dyn LookupObserver>,
    params: LookupParams,
    kind: LookupKind,
    seeds: Vec<Contact>,
    cancel: CancellationToken,
) -> Result<LookupOutcome, DhtError> {
    let local = network.local_contact();
    let target = kind.target();
    let mut state = LookupState::new(target, local.clone(), params.k, seeds);
    let request = kind.request();
    let alpha = params.alpha.max(1);

    let mut queries: JoinSet<QueryResult> = JoinSet::new();
    let deadline = tokio::time::sleep(params.lookup_timeout);
    tokio::pin!(deadline);
    let mut boost = tokio::time::interval(params.boost_frequency);
    boost.tick().await;

    trace!(target = %target.short(), kind = request.name(), "lookup started");

    loop {
        while queries.len() < alpha
            && let Some(contact) = state.next()
        {
            spawn_query(&mut queries, &network, contact, &request, &params);
        }

        if state.is_finished() {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(target = %target.short(), "lookup cancelled");
                return Err(DhtError::Cancelled);
            }
            _ = &mut deadline => {
                debug!(
                    target = %target.short(),
                    in_flight = state.in_flight(),
                    "lookup timed out, returning current results"
                );
                break;
            }
            joined = queries.join_next(), if !queries.is_empty() => {
                let Some(Ok((contact, outcome))) = joined else {
                    continue;
                };
                match handle_outcome(&mut state, &*observer, &params, &kind, &local, contact, outcome).await {
                    Verdict::Continue => {}
                    Verdict::Found(outcome) => return Ok(outcome),
                }
            }
            _ = boost.tick() => {
                if state.should_boost(params.boost_timeout)
                    && let Some(contact) = state.next()
                {
                    trace!(target = %target.short(), to = %contact.addr, "boosting lookup");
                    spawn_query(&mut queries, &network, contact, &request, &params);
                }
            }
        }
    }

    let stats = state.stats();
    let closest = state.closest();
    debug!(
        target = %target.short(),
        found = closest.len(),
        hops = stats.hops,
        queried = stats.queried,
        errors = stats.errors,
        "lookup finished"
    );

    match kind {
        LookupKind::Node { .. } if closest.is_empty() => Err(DhtError::NoSuchNode { key: target }),
        LookupKind::Node { .. } => Ok(LookupOutcome::Nodes {
            closest,
            includes_local: state.includes_local(),
            stats,
        }),
        LookupKind::Value { .. } => Err(DhtError::NoSuchValue { key: target }),
    }
}

fn spawn_query<N: DhtNodeRpc>(
    queries: &mut JoinSet<QueryResult>,
    network: &Arc<N>,
    contact: Contact,
    request: &DhtRequest,
    params: &LookupParams,
) {
    let network = network.clone();
    let request = request.clone();
    let timeout = params.rpc_timeout;
    let max_errors = params.max_errors;
    queries.spawn(async move {
        let outcome = send_with_resend(&*network, contact.addr, request, timeout, max_errors).await;
        (contact, outcome)
    });
}

async fn handle_outcome(
    state: &mut LookupState,
    observer: &dyn LookupObserver,
    params: &LookupParams,
    kind: &LookupKind,
    local: &Contact,
    contact: Contact,
    outcome: RpcOutcome,
) -> Verdict {
    let (from, response) = match outcome {
        RpcOutcome::Response { from, response, .. } => (from, response),
        RpcOutcome::Timeout { elapsed, .. } => {
            trace!(to = %contact.addr, elapsed_ms = elapsed.as_millis() as u64, "lookup query timed out");
            state.on_failure(&contact.identity);
            observer.failed(contact).await;
            return Verdict::Continue;
        }
        RpcOutcome::Error(e) => {
            trace!(to = %contact.addr, error = %e, "lookup query failed");
            state.on_failure(&contact.identity);
            observer.failed(contact).await;
            return Verdict::Continue;
        }
    };

    if let Err(violation) = validate_responder(local, &contact, &from) {
        warn!(to = %contact.addr, error = %violation, "discarding lookup response");
        state.on_failure(&contact.identity);
        return Verdict::Continue;
    }

    match (kind, response) {
        (_, DhtResponse::Nodes { contacts }) => {
            if contacts.is_empty()
                && matches!(kind, LookupKind::Node { .. })
                && !params.accept_empty_find_node_responses
            {
                debug!(from = %from.addr, "discarding empty FIND_NODE response");
                state.on_failure(&contact.identity);
                return Verdict::Continue;
            }
            let contacts = sanitize_contacts(local, contacts);
            let learned = state.on_response(&from, contacts);
            observer.responded(from).await;
            if !learned.is_empty() {
                observer.learned(learned).await;
            }
            Verdict::Continue
        }
        (LookupKind::Value { value_type, .. }, DhtResponse::Values { values, available_keys }) => {
            let (matching, mismatched): (Vec<DhtValue>, Vec<DhtValue>) = values
                .into_iter()
                .partition(|v| value_type.is_none_or(|t| t == v.value_type) && v.primary_key == kind.target());
            if !mismatched.is_empty() {
                warn!(
                    from = %from.addr,
                    count = mismatched.len(),
                    "ignoring values of an unexpected type or key"
                );
            }
            observer.responded(from.clone()).await;
            if matching.is_empty() {
                state.on_response(&from, Vec::new());
                return Verdict::Continue;
            }

            let returned: HashSet<Key> = matching.iter().map(|v| v.secondary_key).collect();
            let remaining_keys = available_keys
                .into_iter()
                .filter(|k| !returned.contains(k))
                .collect();
            state.on_response(&from, Vec::new());
            Verdict::Found(LookupOutcome::Values {
                values: matching,
                remaining_keys,
                responder: from,
                stats: state.stats(),
            })
        }
        (_, DhtResponse::Error { message }) => {
            debug!(from = %from.addr, %message, "lookup query answered with an error");
            state.on_failure(&contact.identity);
            observer.responded(from).await;
            Verdict::Continue
        }
        (_, other) => {
            warn!(from = %from.addr, response = other.name(), "unexpected response to lookup query");
            state.on_failure(&contact.identity);
            Verdict::Continue
        }
    }
}

/// A responder must be who we asked and must not impersonate us.
fn validate_responder(local: &Contact, queried: &Contact, from: &Contact) -> Result<(), DhtError> {
    check_spoof(local, from)?;
    if from.identity != queried.identity {
        return Err(DhtError::ProtocolViolation(format!(
            "{} answered as {} instead of {}",
            queried.addr,
            from.identity.short(),
            queried.identity.short()
        )));
    }
    Ok(())
}

/// Drop returned contacts that impersonate the local node.
fn sanitize_contacts(local: &Contact, contacts: Vec<Contact>) -> Vec<Contact> {
    contacts
        .into_iter()
        .filter(|c| match check_spoof(local, c) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "dropping spoofed contact from lookup response");
                false
            }
        })
        .collect()
}
