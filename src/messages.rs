//! # Wire Protocol Messages
//!
//! Every datagram is one bincode-encoded [`Envelope`]: a transaction id, the
//! sender's contact, and either a request or a response body. Responses echo
//! the request's transaction id so the RPC layer can correlate them.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong { observed_addr }` |
//! | `FindNode { target }` | `Nodes { contacts }` |
//! | `FindValue { key, .. }` | `Values { values, available_keys }` or `Nodes { contacts }` |
//! | `Store { values }` | `StoreStatus { statuses }` (one per value) |
//!
//! ## Limits
//!
//! - `MAX_DATAGRAM_SIZE`: largest payload a single UDP datagram can carry
//! - `MAX_VALUE_SIZE`: largest payload accepted for a stored value
//! - Value lists that would overflow a datagram are split with
//!   [`batch_values`]; FIND_VALUE answers carry the first batch and list the
//!   rest in `available_keys`
//! - All decoding goes through [`deserialize_bounded`]

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Contact, Key};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest stored value payload; leaves room for the envelope inside one datagram.
pub const MAX_VALUE_SIZE: usize = 32 * 1024;

/// Contacts returned in a single response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 64;

/// Room left in a datagram for everything around a value list.
const ENVELOPE_RESERVE: usize = 1024;

/// Transaction identifier correlating a response to its request.
pub type TxId = u64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Encoded size on the wire. Anything over the datagram limit reports `usize::MAX`.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    bincode_options()
        .serialized_size(value)
        .map_or(usize::MAX, |len| len as usize)
}

/// Split `values` into batches that each fit in one datagram next to
/// `reserved` bytes of other response fields. Order is kept; a value too big
/// for any batch travels alone.
pub fn batch_values(values: Vec<DhtValue>, reserved: usize) -> Vec<Vec<DhtValue>> {
    let budget = MAX_DATAGRAM_SIZE.saturating_sub(ENVELOPE_RESERVE.saturating_add(reserved));
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for value in values {
        let len = encoded_len(&value);
        if !current.is_empty() && used.saturating_add(len) > budget {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used = used.saturating_add(len);
        current.push(value);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Kind of payload carried by a value, which drives expiry and republish policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Opaque bytes.
    Binary,
    /// UTF-8 text.
    Text,
    /// Presence record announcing that the originator holds a resource.
    /// Locally originated presence values are only republished while the
    /// resource is rare.
    Location,
    /// Record pointing at the originator's current proxies. Validity is tied
    /// to the local node's live state rather than to a fixed lifetime.
    PushProxy,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::Binary => "binary",
            ValueType::Text => "text",
            ValueType::Location => "location",
            ValueType::PushProxy => "push-proxy",
        };
        f.write_str(name)
    }
}

/// A value as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtValue {
    pub primary_key: Key,
    /// Distinguishes several values under one primary key; defaults to the originator id.
    pub secondary_key: Key,
    pub value_type: ValueType,
    pub payload: Vec<u8>,
    pub originator: Contact,
}

impl DhtValue {
    pub fn new(primary_key: Key, originator: Contact, value_type: ValueType, payload: Vec<u8>) -> Self {
        Self {
            primary_key,
            secondary_key: originator.identity,
            value_type,
            payload,
            originator,
        }
    }

    pub fn with_secondary_key(mut self, secondary_key: Key) -> Self {
        self.secondary_key = secondary_key;
        self
    }

    /// An empty payload asks the receiver to remove the sender's value.
    pub fn is_removal(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreCode {
    Stored,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub primary_key: Key,
    pub secondary_key: Key,
    pub code: StoreCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode {
        target: Key,
    },
    FindValue {
        key: Key,
        /// Restrict the answer to these secondary keys (empty = any).
        secondary_keys: Vec<Key>,
        /// Restrict the answer to this value type (`None` = any).
        value_type: Option<ValueType>,
    },
    Store {
        values: Vec<DhtValue>,
    },
}

impl DhtRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "PING",
            DhtRequest::FindNode { .. } => "FIND_NODE",
            DhtRequest::FindValue { .. } => "FIND_VALUE",
            DhtRequest::Store { .. } => "STORE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong {
        /// Address the request arrived from, as seen by the responder.
        observed_addr: SocketAddr,
    },
    Nodes {
        contacts: Vec<Contact>,
    },
    Values {
        values: Vec<DhtValue>,
        /// Every secondary key the responder holds under the requested key.
        available_keys: Vec<Key>,
    },
    StoreStatus {
        statuses: Vec<StoreStatus>,
    },
    Error {
        message: String,
    },
}

impl DhtResponse {
    pub fn name(&self) -> &'static str {
        match self {
            DhtResponse::Pong { .. } => "PONG",
            DhtResponse::Nodes { .. } => "NODES",
            DhtResponse::Values { .. } => "VALUES",
            DhtResponse::StoreStatus { .. } => "STORE_STATUS",
            DhtResponse::Error { .. } => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(DhtRequest),
    Response(DhtResponse),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub txid: TxId,
    pub from: Contact,
    pub body: Body,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize_bounded(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn contact(seed: u8) -> Contact {
        Contact::new(Identity::from_bytes([seed; 20]), "127.0.0.1:4100".parse().unwrap())
    }

    #[test]
    fn envelope_survives_the_wire() {
        let value = DhtValue::new(
            Identity::from_content(b"song"),
            contact(1),
            ValueType::Location,
            b"10.0.0.1:6346".to_vec(),
        );
        let envelope = Envelope {
            txid: 42,
            from: contact(2),
            body: Body::Request(DhtRequest::Store { values: vec![value.clone()] }),
        };

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.txid, 42);
        assert_eq!(decoded.from, contact(2));
        match decoded.body {
            Body::Request(DhtRequest::Store { values }) => assert_eq!(values, vec![value]),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(Envelope::decode(&garbage).is_err());

        let truncated = Envelope {
            txid: 1,
            from: contact(3),
            body: Body::Request(DhtRequest::Ping),
        }
        .encode()
        .unwrap();
        assert!(Envelope::decode(&truncated[..truncated.len() / 2]).is_err());
    }

    #[test]
    fn oversized_payload_refused_by_encoder() {
        let value = DhtValue::new(
            Identity::from_bytes([9; 20]),
            contact(4),
            ValueType::Binary,
            vec![0u8; MAX_DATAGRAM_SIZE + 1],
        );
        let envelope = Envelope {
            txid: 7,
            from: contact(4),
            body: Body::Request(DhtRequest::Store { values: vec![value] }),
        };
        assert!(envelope.encode().is_err());
    }

    #[test]
    fn large_value_lists_split_into_datagram_sized_batches() {
        let key = Identity::from_bytes([6; 20]);
        let values: Vec<DhtValue> = (0..3u8)
            .map(|i| DhtValue::new(key, contact(10 + i), ValueType::Binary, vec![i; 30_000]))
            .collect();
        let available: Vec<Key> = values.iter().map(|v| v.secondary_key).collect();

        let batches = batch_values(values.clone(), encoded_len(&available));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.concat(), values);
        for batch in batches {
            let envelope = Envelope {
                txid: 1,
                from: contact(20),
                body: Body::Response(DhtResponse::Values {
                    values: batch,
                    available_keys: available.clone(),
                }),
            };
            assert!(envelope.encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
        }

        let small = vec![DhtValue::new(key, contact(30), ValueType::Text, b"x".to_vec())];
        assert_eq!(batch_values(small.clone(), 0), vec![small]);
        assert!(batch_values(Vec::new(), 0).is_empty());
    }

    #[test]
    fn secondary_key_defaults_to_originator() {
        let origin = contact(5);
        let value = DhtValue::new(Identity::from_bytes([1; 20]), origin.clone(), ValueType::Text, b"x".to_vec());
        assert_eq!(value.secondary_key, origin.identity);
        let custom = value.with_secondary_key(Identity::from_bytes([2; 20]));
        assert_eq!(custom.secondary_key, Identity::from_bytes([2; 20]));
        assert!(!custom.is_removal());
    }
}
