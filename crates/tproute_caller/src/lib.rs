//! Client-side service routing for an ATMI-style protocol.
//!
//! One service may be served by several backend domains, each behind its own
//! connection pool. This crate discovers which pools serve what, picks a pool
//! per call (fewest hops first, random within a tier), fails over across
//! pools, pins distributed transactions to one pool and keeps the discovery
//! cache coherent as domains come and go.
//!
//! Entry point: [`CallerRuntime::start`], then [`CallerRuntime::caller`].

pub mod cache;
pub mod caller;
pub mod failed_discovery;
pub mod failover;
pub mod lookup;
pub mod pool;
pub mod pool_store;
pub mod priority;
pub mod repopulate;
pub mod scheduler;
pub mod sticky;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topology;
pub mod transport;
pub mod txn;
pub mod validator;

pub use cache::{DiscoveryCache, PoolsByPriority};
pub use caller::{Caller, CallerRuntime};
pub use failover::{FailoverAlgorithm, FailoverMetricsSnapshot};
pub use lookup::{Lookup, LookupService, ServiceLookup};
pub use pool::PoolEntry;
pub use pool_store::PoolEntryStore;
pub use scheduler::{DelayScheduler, DelayedExecutor, ScheduleError};
pub use sticky::TransactionPoolMapper;
pub use topology::{TopologyChangeHandler, TopologyState};
pub use transport::{
    Connection, ConnectionFactory, ConnectionListener, ConnectionObserver, PendingReply,
    PoolDescriptor, PoolFinder, TpConnectReturn, TransportResult,
};
pub use txn::{LocalTransactionManager, NoTransactionManager, TransactionLess, TransactionManager, TxnStatus};
pub use validator::{ConnectionValidator, ValidationReport, ValidationTimer, ValidationWork};
