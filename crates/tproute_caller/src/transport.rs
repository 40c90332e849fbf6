//! Interfaces to the transport layer.
//!
//! The router never talks to the network itself. It acquires connections
//! from a [`ConnectionFactory`], performs exactly one operation on them and
//! drops them; dropping a connection releases it back to its pool. The only
//! exception is [`Connection::tpconnect`], whose connection is handed to the
//! caller inside [`TpConnectReturn`] and closed when the caller drops it.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tproute_common::error::TransportError;
use tproute_common::types::{
    Buffer, DequeueReturn, DiscoveryResult, DomainId, EnqueueReturn, ErrorState, Flags,
    MessageSelector, QueueInfo, QueueMessage, ServiceDetails, ServiceReturn,
};
use uuid::Uuid;

pub type TransportResult<T> = Result<T, TransportError>;

/// Receives enable/disable notifications for one pool's domain.
pub trait ConnectionListener: Send + Sync {
    /// The domain is reachable again (e.g. the disconnecting connection closed).
    fn connection_enabled(&self);
    /// The domain announced it is disconnecting.
    fn connection_disabled(&self);
}

/// Receives topology-change notifications from a connection.
pub trait ConnectionObserver: Send + Sync {
    fn topology_changed(&self, domain: DomainId);
}

/// Reply of a `tpacall`, delivered later by the transport.
pub struct PendingReply {
    rx: mpsc::Receiver<TransportResult<ServiceReturn>>,
}

impl PendingReply {
    /// Create a reply slot and the sender the transport completes it with.
    pub fn channel() -> (mpsc::Sender<TransportResult<ServiceReturn>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// An already-completed reply.
    pub fn ready(result: TransportResult<ServiceReturn>) -> Self {
        let (tx, reply) = Self::channel();
        let _ = tx.send(result);
        reply
    }

    /// Block until the reply arrives.
    pub fn wait(self) -> TransportResult<ServiceReturn> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(TransportError::connection_lost(
                "reply channel closed before a reply arrived",
            ))
        })
    }

    /// Block for at most `timeout`; `None` if nothing arrived in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransportResult<ServiceReturn>> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(TransportError::connection_lost(
                "reply channel closed before a reply arrived",
            ))),
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").finish_non_exhaustive()
    }
}

/// One checked-out connection to a backend domain.
pub trait Connection: Send {
    fn tpcall(
        &mut self,
        service: &str,
        data: &Buffer,
        flags: Flags,
        execution: Uuid,
    ) -> TransportResult<ServiceReturn>;

    fn tpacall(
        &mut self,
        service: &str,
        data: &Buffer,
        flags: Flags,
        execution: Uuid,
    ) -> TransportResult<PendingReply>;

    /// Open a conversation. On success the conversation keeps using this
    /// connection, so the caller must keep it alive until done.
    fn tpconnect(&mut self, service: &str, data: &Buffer, flags: Flags) -> TransportResult<ErrorState>;

    fn discover(
        &mut self,
        execution: Uuid,
        services: &[String],
        queues: &[String],
    ) -> TransportResult<DiscoveryResult>;

    /// Routes to `service` known by this domain; empty if it does not exist.
    fn service_details(&mut self, service: &str) -> TransportResult<Vec<ServiceDetails>>;

    fn queue_exists(&mut self, queue: &QueueInfo) -> TransportResult<bool>;

    fn enqueue(&mut self, queue: &QueueInfo, message: &QueueMessage) -> TransportResult<EnqueueReturn>;

    fn dequeue(&mut self, queue: &QueueInfo, selector: &MessageSelector) -> TransportResult<DequeueReturn>;

    fn domain_id(&mut self) -> TransportResult<DomainId>;

    fn add_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>);

    fn add_connection_observer(&mut self, observer: Arc<dyn ConnectionObserver>);
}

/// Source of connections for one pool.
pub trait ConnectionFactory: Send + Sync {
    fn connection(&self) -> TransportResult<Box<dyn Connection>>;
}

/// A configured pool as found by enumeration.
#[derive(Clone)]
pub struct PoolDescriptor {
    pub name: String,
    pub factory: Arc<dyn ConnectionFactory>,
}

impl std::fmt::Debug for PoolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDescriptor").field("name", &self.name).finish()
    }
}

/// Enumerates the pools configured under a search root.
pub trait PoolFinder: Send + Sync {
    fn find(&self, search_root: &str) -> Vec<PoolDescriptor>;
}

/// Open conversation returned by `tpconnect`. Owns its connection; dropping
/// it closes the conversation.
pub struct TpConnectReturn {
    pub error_state: ErrorState,
    pub connection: Option<Box<dyn Connection>>,
}

impl TpConnectReturn {
    pub fn not_found() -> Self {
        Self {
            error_state: ErrorState::Tpenoent,
            connection: None,
        }
    }

    /// Close the conversation's connection now.
    pub fn close(mut self) {
        self.connection.take();
    }
}

impl std::fmt::Debug for TpConnectReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpConnectReturn")
            .field("error_state", &self.error_state)
            .field("open", &self.connection.is_some())
            .finish()
    }
}
