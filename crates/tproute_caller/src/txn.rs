//! Transaction context.
//!
//! The router only needs three things from a transaction manager: which
//! transaction (if any) the calling thread is in, a way to step outside it
//! for TPNOTRAN calls and discovery RPCs, and a completion hook so sticky
//! routing state dies with the transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use uuid::Uuid;

use tproute_common::error::{CallerError, CallerResult, TransportError};
use tproute_common::types::{DiscoveryResult, QueueInfo, ServiceDetails, TxnId};

use crate::cache::CachedNames;
use crate::pool::PoolEntry;

/// Terminal status passed to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Committed,
    RolledBack,
    Unknown,
}

pub type CompletionCallback = Box<dyn FnOnce(TxnStatus) + Send>;

pub trait TransactionManager: Send + Sync {
    /// Transaction associated with the calling thread.
    fn current(&self) -> Option<TxnId>;

    /// Detach the calling thread from its transaction, returning it.
    fn suspend(&self) -> Option<TxnId>;

    /// Re-attach a previously suspended transaction to the calling thread.
    fn resume(&self, txn: TxnId);

    /// Run `callback` once `txn` reaches any terminal status.
    fn register_completion(&self, txn: TxnId, callback: CompletionCallback) -> CallerResult<()>;
}

/// Transaction manager for deployments without distributed transactions.
#[derive(Debug, Default)]
pub struct NoTransactionManager;

impl TransactionManager for NoTransactionManager {
    fn current(&self) -> Option<TxnId> {
        None
    }

    fn suspend(&self) -> Option<TxnId> {
        None
    }

    fn resume(&self, _txn: TxnId) {}

    fn register_completion(&self, txn: TxnId, _callback: CompletionCallback) -> CallerResult<()> {
        Err(CallerError::Internal(format!(
            "no transaction manager available to track {txn}"
        )))
    }
}

/// In-process, thread-associated transaction manager.
pub struct LocalTransactionManager {
    next_id: AtomicU64,
    by_thread: Mutex<HashMap<ThreadId, TxnId>>,
    callbacks: Mutex<HashMap<TxnId, Vec<CompletionCallback>>>,
}

impl LocalTransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            by_thread: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Start a transaction on the calling thread.
    pub fn begin(&self) -> CallerResult<TxnId> {
        let me = std::thread::current().id();
        let mut by_thread = self.by_thread.lock();
        if let Some(existing) = by_thread.get(&me) {
            return Err(CallerError::Internal(format!(
                "thread already associated with {existing}"
            )));
        }
        let txn = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        by_thread.insert(me, txn);
        tracing::debug!(txn = %txn, "transaction started");
        Ok(txn)
    }

    pub fn commit(&self) -> CallerResult<()> {
        self.complete(TxnStatus::Committed)
    }

    pub fn rollback(&self) -> CallerResult<()> {
        self.complete(TxnStatus::RolledBack)
    }

    fn complete(&self, status: TxnStatus) -> CallerResult<()> {
        let me = std::thread::current().id();
        let txn = self
            .by_thread
            .lock()
            .remove(&me)
            .ok_or_else(|| CallerError::Internal("no transaction on this thread".into()))?;
        let callbacks = self.callbacks.lock().remove(&txn).unwrap_or_default();
        tracing::debug!(txn = %txn, status = ?status, callbacks = callbacks.len(), "transaction completed");
        for callback in callbacks {
            callback(status);
        }
        Ok(())
    }
}

impl TransactionManager for LocalTransactionManager {
    fn current(&self) -> Option<TxnId> {
        self.by_thread.lock().get(&std::thread::current().id()).copied()
    }

    fn suspend(&self) -> Option<TxnId> {
        self.by_thread.lock().remove(&std::thread::current().id())
    }

    fn resume(&self, txn: TxnId) {
        self.by_thread.lock().insert(std::thread::current().id(), txn);
    }

    fn register_completion(&self, txn: TxnId, callback: CompletionCallback) -> CallerResult<()> {
        self.callbacks.lock().entry(txn).or_default().push(callback);
        Ok(())
    }
}

/// Resumes a suspended transaction when dropped, including on unwind.
struct ResumeGuard<'a> {
    tx: &'a dyn TransactionManager,
    suspended: Option<TxnId>,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.suspended.take() {
            self.tx.resume(txn);
        }
    }
}

/// Runs work outside of the caller's transaction (TPNOTRAN calls and all
/// discovery traffic). Every connection it acquires is released before it
/// returns.
#[derive(Clone)]
pub struct TransactionLess {
    tx: Arc<dyn TransactionManager>,
}

impl TransactionLess {
    pub fn new(tx: Arc<dyn TransactionManager>) -> Self {
        Self { tx }
    }

    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.tx
    }

    pub fn run<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = ResumeGuard {
            tx: self.tx.as_ref(),
            suspended: self.tx.suspend(),
        };
        f()
    }

    pub fn service_details(
        &self,
        pool: &PoolEntry,
        service: &str,
    ) -> Result<Vec<ServiceDetails>, TransportError> {
        self.run(|| {
            let mut con = pool.connection()?;
            con.service_details(service)
        })
    }

    pub fn queue_exists(&self, pool: &PoolEntry, queue: &QueueInfo) -> Result<bool, TransportError> {
        self.run(|| {
            let mut con = pool.connection()?;
            con.queue_exists(queue)
        })
    }

    /// Ask `pool` about every known service and queue. A failure invalidates
    /// the pool and yields `None`.
    pub fn discover(&self, pool: &PoolEntry, names: &CachedNames) -> Option<DiscoveryResult> {
        tracing::debug!(
            pool = %pool.name(),
            services = names.services.len(),
            queues = names.queues.len(),
            "issuing domain discovery for all known services and queues"
        );
        let result = self.run(|| {
            let mut con = pool.connection()?;
            con.discover(Uuid::new_v4(), &names.services, &names.queues)
        });
        match result {
            Ok(discovery) => Some(discovery),
            Err(e) => {
                pool.invalidate();
                tracing::warn!(
                    pool = %pool.name(),
                    error = %e,
                    services = ?names.services,
                    queues = ?names.queues,
                    "domain discovery failed"
                );
                None
            }
        }
    }
}
