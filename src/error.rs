//! # Error Taxonomy
//!
//! Every whole-operation failure the engine can surface is a [`DhtError`].
//! Network and protocol faults are absorbed as close to the wire as possible
//! (resend, skip the response, move to the next candidate); only terminal
//! outcomes reach callers.
//!
//! | Variant | Raised by | Caller sees it when |
//! |---------|-----------|---------------------|
//! | `InvalidIdentifier` | key construction | malformed byte length or hex |
//! | `Timeout` | RPC layer | resend budget exhausted |
//! | `ProtocolViolation` | RPC and lookup validation | never fatal to a lookup, only to a single exchange |
//! | `NoSuchNode` / `NoSuchValue` | lookup engine | frontier exhausted with nothing usable |
//! | `PersistenceFailure` | snapshot load/save | logged, startup continues with empty state |
//! | `Cancelled` | operation handles | the operation was cancelled before it finished |
//! | `Closed` | actors and transports | the owning component has shut down |
//!
//! Starting a controller whose preconditions are not met is deliberately
//! *not* an error: the call is a silent no-op.

use std::time::Duration;

use crate::identity::Key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Key material had the wrong length or encoding.
    InvalidIdentifier { len: usize },
    /// A request went unanswered after all resends.
    Timeout { elapsed: Duration },
    /// A remote peer sent something that breaks the protocol contract.
    ProtocolViolation(String),
    /// A node lookup found no responsive contacts.
    NoSuchNode { key: Key },
    /// A value lookup finished without any matching value.
    NoSuchValue { key: Key },
    /// Reading or writing persisted state failed.
    PersistenceFailure(String),
    /// The operation was cancelled through its handle.
    Cancelled,
    /// The component serving the request has shut down.
    Closed,
    /// Socket-level failure while sending.
    Io(String),
}

impl DhtError {
    /// True for the two terminal "nothing found" lookup outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchNode { .. } | Self::NoSuchValue { .. })
    }
}

impl std::fmt::Display for DhtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier { len } => {
                write!(f, "invalid identifier: expected 20 bytes, got {len}")
            }
            Self::Timeout { elapsed } => {
                write!(f, "request timed out after {}ms", elapsed.as_millis())
            }
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::NoSuchNode { key } => write!(f, "no node found for {key}"),
            Self::NoSuchValue { key } => write!(f, "no value found for {key}"),
            Self::PersistenceFailure(msg) => write!(f, "persistence failure: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Closed => write!(f, "component closed"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for DhtError {}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        Self::ProtocolViolation(format!("malformed message: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_key() {
        let key = Key::from_bytes([0xab; 20]);
        let msg = DhtError::NoSuchValue { key }.to_string();
        assert!(msg.contains("abab"));
        assert!(DhtError::NoSuchValue { key }.is_not_found());
        assert!(!DhtError::Cancelled.is_not_found());
    }

    #[test]
    fn io_errors_convert() {
        let err: DhtError = std::io::Error::other("boom").into();
        assert!(matches!(err, DhtError::Io(ref m) if m.contains("boom")));
    }
}
