//! Identifiers and protocol value types shared by the router and its
//! transports.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable name of a configured pool (connection factory entry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolName(String);

impl PoolName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PoolName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Distributed transaction identity as seen by the local transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Identity of a backend domain. Two ids are the same domain iff their
/// uuids match; the name is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainId {
    pub id: Uuid,
    pub name: String,
}

impl DomainId {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn random(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), name)
    }
}

impl PartialEq for DomainId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DomainId {}

impl std::hash::Hash for DomainId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Hop count to a service through a pool. Lower is preferred.
pub type Priority = u64;

/// ATMI call flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    pub const TPNOBLOCK: u32 = 0x0000_0001;
    pub const TPSIGRSTRT: u32 = 0x0000_0002;
    pub const TPNOREPLY: u32 = 0x0000_0004;
    pub const TPNOTRAN: u32 = 0x0000_0008;
    pub const TPNOTIME: u32 = 0x0000_0100;
    pub const TPSENDONLY: u32 = 0x0000_0800;
    pub const TPRECVONLY: u32 = 0x0000_1000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(bits: u32) -> Self {
        Self(bits)
    }

    pub fn with(self, bits: u32) -> Self {
        Self(self.0 | bits)
    }

    pub fn is_set(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Typed message buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub type_name: String,
    pub payload: Bytes,
}

impl Buffer {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new("X_OCTET", Bytes::new())
    }
}

/// Protocol-level outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorState {
    Ok,
    /// No such service or queue.
    Tpenoent,
    Tpesvcfail,
    Tpesvcerr,
    Tpetime,
    Tpesystem,
    Tpeproto,
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorState::Ok => write!(f, "OK"),
            ErrorState::Tpenoent => write!(f, "TPENOENT"),
            ErrorState::Tpesvcfail => write!(f, "TPESVCFAIL"),
            ErrorState::Tpesvcerr => write!(f, "TPESVCERR"),
            ErrorState::Tpetime => write!(f, "TPETIME"),
            ErrorState::Tpesystem => write!(f, "TPESYSTEM"),
            ErrorState::Tpeproto => write!(f, "TPEPROTO"),
        }
    }
}

/// Service-level outcome reported by the called service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceReturnState {
    TpSuccess,
    TpFail,
}

/// Reply of a `tpcall`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReturn {
    pub reply: Buffer,
    pub state: ServiceReturnState,
    pub error_state: ErrorState,
    pub user_code: i64,
}

impl ServiceReturn {
    pub fn success(reply: Buffer) -> Self {
        Self {
            reply,
            state: ServiceReturnState::TpSuccess,
            error_state: ErrorState::Ok,
            user_code: 0,
        }
    }

    /// The reply a caller receives when no pool serves the service.
    pub fn not_found() -> Self {
        Self {
            reply: Buffer::empty(),
            state: ServiceReturnState::TpFail,
            error_state: ErrorState::Tpenoent,
            user_code: 0,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.error_state == ErrorState::Tpenoent
    }
}

/// One discovered route to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDetails {
    pub name: String,
    pub category: String,
    pub hops: Priority,
}

impl ServiceDetails {
    pub fn new(name: impl Into<String>, hops: Priority) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
            hops,
        }
    }
}

/// A queue found by domain discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDetails {
    pub name: String,
    pub retries: u64,
}

/// Answer of a domain discovery RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub services: Vec<ServiceDetails>,
    pub queues: Vec<QueueDetails>,
}

/// Address of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueInfo {
    pub name: String,
}

impl QueueInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub correlation: Option<String>,
    pub payload: Buffer,
}

impl QueueMessage {
    pub fn new(payload: Buffer) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation: None,
            payload,
        }
    }
}

/// Dequeue filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSelector {
    pub correlation: Option<String>,
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReturn {
    pub message_id: Option<Uuid>,
    pub error_state: ErrorState,
}

impl EnqueueReturn {
    pub fn not_found() -> Self {
        Self {
            message_id: None,
            error_state: ErrorState::Tpenoent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueReturn {
    pub messages: Vec<QueueMessage>,
    pub error_state: ErrorState,
}

impl DequeueReturn {
    pub fn not_found() -> Self {
        Self {
            messages: Vec::new(),
            error_state: ErrorState::Tpenoent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_id_equality_ignores_name() {
        let id = Uuid::new_v4();
        assert_eq!(DomainId::new(id, "a"), DomainId::new(id, "b"));
        assert_ne!(DomainId::random("a"), DomainId::random("a"));
    }

    #[test]
    fn test_flags() {
        let flags = Flags::empty().with(Flags::TPNOTRAN);
        assert!(flags.is_set(Flags::TPNOTRAN));
        assert!(!flags.is_set(Flags::TPNOREPLY));
        assert!(!Flags::default().is_set(Flags::TPNOTRAN));
    }

    #[test]
    fn test_not_found_return() {
        assert!(ServiceReturn::not_found().is_not_found());
        assert!(!ServiceReturn::success(Buffer::empty()).is_not_found());
    }
}
