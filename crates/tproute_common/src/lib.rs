//! Shared vocabulary of the tproute service router: error taxonomy,
//! configuration, identifiers and protocol value types.

pub mod config;
pub mod crash_domain;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::CallerConfig;
pub use error::{CallerError, CallerResult, ErrorKind, TransportError, TransportErrorKind};
pub use shutdown::StopSignal;
pub use types::{
    Buffer, DequeueReturn, DiscoveryResult, DomainId, EnqueueReturn, ErrorState, Flags,
    MessageSelector, PoolName, Priority, QueueDetails, QueueInfo, QueueMessage, ServiceDetails,
    ServiceReturn, ServiceReturnState, TxnId,
};
