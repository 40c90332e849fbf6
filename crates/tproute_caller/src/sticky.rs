//! Transaction stickiness: pin a distributed transaction to one pool.
//!
//! The first routed call of a transaction records its pool and an execution
//! id; later calls in the same transaction reuse both while that pool is
//! usable. A record is removed only by the transaction's completion
//! callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use tproute_common::error::{CallerError, CallerResult};
use tproute_common::types::{PoolName, TxnId};

use crate::pool::PoolEntry;
use crate::txn::TransactionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyInfo {
    pub pool: PoolName,
    pub execution: Uuid,
}

/// A sticky pool picked for one call.
#[derive(Debug, Clone)]
pub struct StickiedCall {
    pub pool: Arc<PoolEntry>,
    pub execution: Uuid,
}

type StickyMap = Arc<Mutex<HashMap<TxnId, StickyInfo>>>;

pub struct TransactionPoolMapper {
    enabled: AtomicBool,
    tx: Arc<dyn TransactionManager>,
    stickies: StickyMap,
}

impl TransactionPoolMapper {
    pub fn new(enabled: bool, tx: Arc<dyn TransactionManager>) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(enabled),
            tx,
            stickies: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Stickiness is configured and the calling thread is in a transaction.
    pub fn is_active(&self) -> bool {
        self.is_enabled() && self.tx.current().is_some()
    }

    /// Pick the sticky pool for a call to `service`.
    ///
    /// Without a record the first candidate becomes sticky. With a record,
    /// its pool is used if it is among the usable candidates. Either way the
    /// chosen pool is taken out of `candidates`. `None` leaves the record
    /// untouched.
    pub fn resolve(
        &self,
        service: &str,
        candidates: &mut Vec<Arc<PoolEntry>>,
    ) -> CallerResult<Option<StickiedCall>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let Some(txn) = self.tx.current() else {
            return Ok(None);
        };

        let mut stickies = self.stickies.lock();
        if let Some(info) = stickies.get(&txn) {
            let position = candidates
                .iter()
                .position(|pool| pool.name() == &info.pool && pool.is_valid());
            return Ok(match position {
                Some(i) => {
                    tracing::debug!(txn = %txn, service = service, pool = %info.pool, "using sticky pool");
                    Some(StickiedCall {
                        pool: candidates.remove(i),
                        execution: info.execution,
                    })
                }
                None => {
                    tracing::debug!(
                        txn = %txn,
                        service = service,
                        sticky = %info.pool,
                        candidates = ?candidates.iter().map(|p| p.name().as_str()).collect::<Vec<_>>(),
                        "sticky pool does not serve the service right now, using available pools"
                    );
                    None
                }
            });
        }

        if candidates.is_empty() {
            return Ok(None);
        }
        let pool = candidates.remove(0);
        let info = StickyInfo {
            pool: pool.name().clone(),
            execution: Uuid::new_v4(),
        };
        stickies.insert(txn, info.clone());
        drop(stickies);
        tracing::debug!(txn = %txn, service = service, pool = %info.pool, execution = %info.execution, "transaction stickied");
        self.register_cleanup(txn);
        Ok(Some(StickiedCall {
            pool,
            execution: info.execution,
        }))
    }

    /// Pin the current transaction to `pool`.
    ///
    /// Returns `None` when stickiness is inactive. Pinning to the pool already
    /// recorded is a no-op; pinning to a different one is refused.
    pub fn set_sticky(&self, pool: &PoolName) -> CallerResult<Option<StickyInfo>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let Some(txn) = self.tx.current() else {
            return Ok(None);
        };
        let mut stickies = self.stickies.lock();
        if let Some(existing) = stickies.get(&txn) {
            if &existing.pool == pool {
                return Ok(Some(existing.clone()));
            }
            tracing::error!(
                txn = %txn,
                existing = %existing.pool,
                requested = %pool,
                "refusing to stick a transaction to a second pool"
            );
            return Err(CallerError::StickyConflict {
                txn,
                existing: existing.pool.clone(),
                requested: pool.clone(),
            });
        }
        let info = StickyInfo {
            pool: pool.clone(),
            execution: Uuid::new_v4(),
        };
        stickies.insert(txn, info.clone());
        drop(stickies);
        self.register_cleanup(txn);
        Ok(Some(info))
    }

    pub fn sticky_for_current(&self) -> Option<StickyInfo> {
        if !self.is_enabled() {
            return None;
        }
        let txn = self.tx.current()?;
        self.stickies.lock().get(&txn).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.stickies.lock().len()
    }

    pub fn tracked_count_for(&self, pool: &PoolName) -> usize {
        self.stickies
            .lock()
            .values()
            .filter(|info| &info.pool == pool)
            .count()
    }

    pub fn purge_all(&self) {
        let mut stickies = self.stickies.lock();
        let purged = stickies.len();
        stickies.clear();
        tracing::info!(purged = purged, "all sticky mappings purged");
    }

    pub fn purge_pool(&self, pool: &PoolName) {
        let mut stickies = self.stickies.lock();
        let before = stickies.len();
        stickies.retain(|_, info| &info.pool != pool);
        tracing::info!(pool = %pool, purged = before - stickies.len(), "sticky mappings purged for pool");
    }

    fn register_cleanup(&self, txn: TxnId) {
        let stickies = Arc::downgrade(&self.stickies);
        let registered = self.tx.register_completion(
            txn,
            Box::new(move |status| {
                if let Some(stickies) = stickies.upgrade() {
                    stickies.lock().remove(&txn);
                }
                tracing::debug!(txn = %txn, status = ?status, "sticky mapping removed on completion");
            }),
        );
        if let Err(e) = registered {
            tracing::error!(
                txn = %txn,
                error = %e,
                "could not register completion callback, sticky mapping will not be removed"
            );
        }
    }
}
