//! Failover across the pools serving a service.
//!
//! Candidates come from the lookup, best first. When stickiness is active the
//! transaction's sticky pool is tried first, then every remaining candidate
//! in order. A retryable failure invalidates the pool and moves on; a
//! non-retryable one invalidates the pool and ends the call, since the
//! in-flight work is already rollback-only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use tproute_common::error::{CallerError, CallerResult, TransportError};
use tproute_common::types::ServiceReturn;

use crate::lookup::ServiceLookup;
use crate::pool::PoolEntry;
use crate::sticky::TransactionPoolMapper;
use crate::transport::{Connection, TpConnectReturn, TransportResult};

/// Outcome of a routed call that can report "no such service".
pub trait RoutedReply {
    fn is_not_found(&self) -> bool;
}

impl RoutedReply for ServiceReturn {
    fn is_not_found(&self) -> bool {
        ServiceReturn::is_not_found(self)
    }
}

impl RoutedReply for TpConnectReturn {
    fn is_not_found(&self) -> bool {
        self.error_state == tproute_common::types::ErrorState::Tpenoent
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FailoverMetrics {
    calls: AtomicU64,
    sticky_calls: AtomicU64,
    retryable_failures: AtomicU64,
    fatal_failures: AtomicU64,
    not_found_retries: AtomicU64,
    not_found_replies: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverMetricsSnapshot {
    /// Routed calls started.
    pub calls: u64,
    /// Calls attempted on a transaction's sticky pool.
    pub sticky_calls: u64,
    /// Pool attempts that failed and moved on to the next candidate.
    pub retryable_failures: u64,
    /// Pool attempts that ended the call as rollback-only.
    pub fatal_failures: u64,
    /// Calls re-routed after a pool reported the service missing.
    pub not_found_retries: u64,
    /// Calls answered with the not-found reply because no pool was usable.
    pub not_found_replies: u64,
    /// Calls that failed on every candidate.
    pub exhausted: u64,
}

impl FailoverMetrics {
    pub fn snapshot(&self) -> FailoverMetricsSnapshot {
        FailoverMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            sticky_calls: self.sticky_calls.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            fatal_failures: self.fatal_failures.load(Ordering::Relaxed),
            not_found_retries: self.not_found_retries.load(Ordering::Relaxed),
            not_found_replies: self.not_found_replies.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

// ── Algorithm ───────────────────────────────────────────────────────────────

pub struct FailoverAlgorithm {
    mapper: Arc<TransactionPoolMapper>,
    metrics: FailoverMetrics,
}

impl FailoverAlgorithm {
    pub fn new(mapper: Arc<TransactionPoolMapper>) -> Self {
        Self {
            mapper,
            metrics: FailoverMetrics::default(),
        }
    }

    pub fn metrics(&self) -> FailoverMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn mapper(&self) -> &Arc<TransactionPoolMapper> {
        &self.mapper
    }

    /// Route a synchronous call.
    ///
    /// `do_call` receives a checked-out connection and the execution id to
    /// use; the connection is released when `do_call` drops it. If the reply
    /// says the service is missing, the service is evicted from the cache and
    /// the call is routed once more. `not_found` builds the reply used when no
    /// usable pool exists.
    pub fn call_with_failover<T, F, N>(
        &self,
        service: &str,
        lookup: &dyn ServiceLookup,
        mut do_call: F,
        not_found: N,
    ) -> CallerResult<T>
    where
        T: RoutedReply,
        F: FnMut(Box<dyn Connection>, Uuid) -> TransportResult<T>,
        N: Fn() -> T,
    {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        let candidates = self.usable_candidates(lookup, service);
        if candidates.is_empty() {
            return Ok(self.no_candidates(service, &not_found));
        }

        let result = self.issue_call(service, candidates, &mut do_call)?;
        if !result.is_not_found() {
            return Ok(result);
        }

        // A cached route went stale. Rediscover and try once more.
        self.metrics.not_found_retries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(service = service, "service not found on cached pool, rediscovering");
        lookup.remove_from_service_cache(service);
        let candidates = self.usable_candidates(lookup, service);
        if candidates.is_empty() {
            return Ok(self.no_candidates(service, &not_found));
        }
        self.issue_call(service, candidates, &mut do_call)
    }

    /// Synchronous `tpcall` routing.
    pub fn tpcall_with_failover<F>(
        &self,
        service: &str,
        lookup: &dyn ServiceLookup,
        do_call: F,
    ) -> CallerResult<ServiceReturn>
    where
        F: FnMut(Box<dyn Connection>, Uuid) -> TransportResult<ServiceReturn>,
    {
        self.call_with_failover(service, lookup, do_call, ServiceReturn::not_found)
    }

    /// Asynchronous call routing. Whether the service exists is only known
    /// once the reply arrives, so there is no not-found retry.
    pub fn tpacall_with_failover<T, F, N>(
        &self,
        service: &str,
        lookup: &dyn ServiceLookup,
        mut do_call: F,
        not_found: N,
    ) -> CallerResult<T>
    where
        F: FnMut(Box<dyn Connection>, Uuid) -> TransportResult<T>,
        N: Fn() -> T,
    {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        let candidates = self.usable_candidates(lookup, service);
        if candidates.is_empty() {
            return Ok(self.no_candidates(service, &not_found));
        }
        self.issue_call(service, candidates, &mut do_call)
    }

    fn usable_candidates(&self, lookup: &dyn ServiceLookup, service: &str) -> Vec<Arc<PoolEntry>> {
        let all = lookup.get_service(service);
        let total = all.len();
        let usable: Vec<Arc<PoolEntry>> = all.into_iter().filter(|p| p.is_valid()).collect();
        tracing::debug!(
            service = service,
            usable = usable.len(),
            total = total,
            "candidate pools for service"
        );
        usable
    }

    fn no_candidates<T, N: Fn() -> T>(&self, service: &str, not_found: &N) -> T {
        self.metrics.not_found_replies.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(service = service, "no usable pool serves the service");
        not_found()
    }

    fn issue_call<T, F>(
        &self,
        service: &str,
        mut candidates: Vec<Arc<PoolEntry>>,
        do_call: &mut F,
    ) -> CallerResult<T>
    where
        F: FnMut(Box<dyn Connection>, Uuid) -> TransportResult<T>,
    {
        let mut last: Option<TransportError> = None;
        let mut attempted = 0usize;

        if self.mapper.is_active() {
            if let Some(sticky) = self.mapper.resolve(service, &mut candidates)? {
                self.metrics.sticky_calls.fetch_add(1, Ordering::Relaxed);
                attempted += 1;
                match attempt(&sticky.pool, sticky.execution, do_call) {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        sticky.pool.invalidate();
                        if !e.is_retryable() {
                            return Err(self.rollback_only(service, &sticky.pool, e));
                        }
                        self.metrics.retryable_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            service = service,
                            pool = %sticky.pool.name(),
                            error = %e,
                            "sticky pool failed, continuing with remaining pools"
                        );
                        last = Some(e);
                    }
                }
            }
        }

        for pool in &candidates {
            attempted += 1;
            match attempt(pool, Uuid::new_v4(), do_call) {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    pool.invalidate();
                    if !e.is_retryable() {
                        return Err(self.rollback_only(service, pool, e));
                    }
                    self.metrics.retryable_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        service = service,
                        pool = %pool.name(),
                        error = %e,
                        "call failed on pool, trying next"
                    );
                    last = Some(e);
                }
            }
        }

        self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(CallerError::AllPoolsFailed {
            service: service.to_string(),
            attempted,
            last,
        })
    }

    fn rollback_only(&self, service: &str, pool: &PoolEntry, source: TransportError) -> CallerError {
        self.metrics.fatal_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            service = service,
            pool = %pool.name(),
            error = %source,
            "connection failed during call, no failover possible"
        );
        CallerError::RollbackOnly {
            service: service.to_string(),
            pool: pool.name().clone(),
            source,
        }
    }
}

fn attempt<T, F>(pool: &PoolEntry, execution: Uuid, do_call: &mut F) -> TransportResult<T>
where
    F: FnMut(Box<dyn Connection>, Uuid) -> TransportResult<T>,
{
    let con = pool.connection()?;
    do_call(con, execution)
}
