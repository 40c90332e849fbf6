//! Public call surface and the runtime that wires it together.
//!
//! [`CallerRuntime::start`] builds every component by explicit injection and
//! owns the background threads (topology scheduler and validation timer).
//! Calls go through [`Caller`].

use std::sync::{Arc, Weak};

use tproute_common::config::CallerConfig;
use tproute_common::error::{CallerError, CallerResult};
use tproute_common::types::{
    Buffer, DequeueReturn, EnqueueReturn, ErrorState, Flags, MessageSelector, QueueInfo,
    QueueMessage, ServiceDetails, ServiceReturn,
};

use crate::cache::DiscoveryCache;
use crate::failed_discovery::FailedDiscoveryHandler;
use crate::failover::{FailoverAlgorithm, FailoverMetricsSnapshot};
use crate::lookup::{Lookup, LookupService, ServiceLookup};
use crate::pool_store::PoolEntryStore;
use crate::repopulate::CacheRepopulator;
use crate::scheduler::{DelayScheduler, DelayedExecutor};
use crate::sticky::TransactionPoolMapper;
use crate::topology::TopologyChangeHandler;
use crate::transport::{ConnectionObserver, PendingReply, PoolFinder, TpConnectReturn};
use crate::txn::{TransactionLess, TransactionManager};
use crate::validator::{ConnectionValidator, ValidationReport, ValidationTimer, ValidationWork};

// ── Caller ──────────────────────────────────────────────────────────────────

pub struct Caller {
    lookup: Arc<dyn ServiceLookup>,
    failover: FailoverAlgorithm,
    tx_less: TransactionLess,
    failed_discovery: FailedDiscoveryHandler,
}

impl Caller {
    pub fn new(
        lookup: Arc<dyn ServiceLookup>,
        failover: FailoverAlgorithm,
        tx_less: TransactionLess,
        failed_discovery: FailedDiscoveryHandler,
    ) -> Self {
        Self {
            lookup,
            failover,
            tx_less,
            failed_discovery,
        }
    }

    /// Synchronous call. `TPNOTRAN` runs it outside the caller's transaction.
    pub fn tpcall(&self, service: &str, data: &Buffer, flags: Flags) -> CallerResult<ServiceReturn> {
        self.failed_discovery.issue_domain_discovery_and_repopulate();
        let route = || {
            self.failover
                .tpcall_with_failover(service, self.lookup.as_ref(), |mut con, execution| {
                    con.tpcall(service, data, flags, execution)
                })
        };
        self.outside_transaction_if(flags, route)
    }

    /// Asynchronous call. The reply arrives through the returned handle; a
    /// missing service is reported as an already-completed not-found reply.
    pub fn tpacall(&self, service: &str, data: &Buffer, flags: Flags) -> CallerResult<PendingReply> {
        self.failed_discovery.issue_domain_discovery_and_repopulate();
        let route = || {
            self.failover.tpacall_with_failover(
                service,
                self.lookup.as_ref(),
                |mut con, execution| con.tpacall(service, data, flags, execution),
                || PendingReply::ready(Ok(ServiceReturn::not_found())),
            )
        };
        self.outside_transaction_if(flags, route)
    }

    /// Open a conversation. On success the returned value owns the
    /// connection; dropping it (or calling `close`) ends the conversation.
    pub fn tpconnect(&self, service: &str, data: &Buffer, flags: Flags) -> CallerResult<TpConnectReturn> {
        self.failed_discovery.issue_domain_discovery_and_repopulate();
        let route = || {
            self.failover.call_with_failover(
                service,
                self.lookup.as_ref(),
                |mut con, _execution| {
                    let error_state = con.tpconnect(service, data, flags)?;
                    let connection = (error_state == ErrorState::Ok).then_some(con);
                    Ok(TpConnectReturn {
                        error_state,
                        connection,
                    })
                },
                TpConnectReturn::not_found,
            )
        };
        self.outside_transaction_if(flags, route)
    }

    pub fn enqueue(&self, queue: &QueueInfo, message: &QueueMessage) -> CallerResult<EnqueueReturn> {
        self.failed_discovery.issue_domain_discovery_and_repopulate();
        let Some(pool) = self.lookup.get_queue(queue) else {
            tracing::debug!(queue = %queue.name, "no pool holds queue");
            return Ok(EnqueueReturn::not_found());
        };
        let mut con = pool.connection()?;
        Ok(con.enqueue(queue, message)?)
    }

    pub fn dequeue(&self, queue: &QueueInfo, selector: &MessageSelector) -> CallerResult<DequeueReturn> {
        self.failed_discovery.issue_domain_discovery_and_repopulate();
        let Some(pool) = self.lookup.get_queue(queue) else {
            tracing::debug!(queue = %queue.name, "no pool holds queue");
            return Ok(DequeueReturn::not_found());
        };
        let mut con = pool.connection()?;
        Ok(con.dequeue(queue, selector)?)
    }

    pub fn service_exists(&self, service: &str) -> bool {
        !self.lookup.get_service(service).is_empty()
    }

    pub fn queue_exists(&self, queue: &QueueInfo) -> bool {
        self.lookup.get_queue(queue).is_some()
    }

    /// Route details depend on which pool answers, so the router does not
    /// offer them. Ask a specific pool instead.
    pub fn service_details(&self, service: &str) -> CallerResult<Vec<ServiceDetails>> {
        Err(CallerError::Unsupported(format!(
            "service details for '{service}' must be requested from a specific pool"
        )))
    }

    pub fn failover_metrics(&self) -> FailoverMetricsSnapshot {
        self.failover.metrics()
    }

    fn outside_transaction_if<T, F>(&self, flags: Flags, route: F) -> T
    where
        F: FnOnce() -> T,
    {
        if flags.is_set(Flags::TPNOTRAN) {
            self.tx_less.run(route)
        } else {
            route()
        }
    }
}

// ── Runtime ─────────────────────────────────────────────────────────────────

pub struct CallerRuntime {
    config: CallerConfig,
    caller: Caller,
    store: Arc<PoolEntryStore>,
    cache: Arc<DiscoveryCache>,
    mapper: Arc<TransactionPoolMapper>,
    topology: Arc<TopologyChangeHandler>,
    scheduler: Option<Arc<DelayScheduler>>,
    validation: Arc<ValidationWork>,
    timer: Option<ValidationTimer>,
}

impl CallerRuntime {
    /// Wire every component, enumerate pools and start the background
    /// threads. Fails when no pool is configured under the search root.
    pub fn start(
        config: CallerConfig,
        finder: Arc<dyn PoolFinder>,
        tx_manager: Arc<dyn TransactionManager>,
    ) -> CallerResult<Self> {
        config.validate()?;
        let scheduler = DelayScheduler::start("tproute-topology", config.scheduler_capacity)
            .map_err(|e| CallerError::Internal(format!("failed to start topology scheduler: {e}")))?;
        let executor: Arc<dyn DelayedExecutor> = scheduler.clone();
        let started = Self::assemble(config, finder, tx_manager, executor);
        match started {
            Ok(mut runtime) => {
                runtime.scheduler = Some(scheduler);
                Ok(runtime)
            }
            Err(e) => {
                scheduler.shutdown();
                Err(e)
            }
        }
    }

    /// Like [`start`](Self::start) with a caller-provided executor for
    /// topology-change tasks. The runtime does not shut it down.
    pub fn start_with_executor(
        config: CallerConfig,
        finder: Arc<dyn PoolFinder>,
        tx_manager: Arc<dyn TransactionManager>,
        executor: Arc<dyn DelayedExecutor>,
    ) -> CallerResult<Self> {
        config.validate()?;
        Self::assemble(config, finder, tx_manager, executor)
    }

    fn assemble(
        config: CallerConfig,
        finder: Arc<dyn PoolFinder>,
        tx_manager: Arc<dyn TransactionManager>,
        executor: Arc<dyn DelayedExecutor>,
    ) -> CallerResult<Self> {
        let tx_less = TransactionLess::new(tx_manager.clone());
        let cache = DiscoveryCache::new();
        let store = PoolEntryStore::new(finder, config.search_root.clone());
        let repopulator = CacheRepopulator::new(cache.clone(), tx_less.clone());

        let topology = TopologyChangeHandler::new(
            store.clone(),
            repopulator.clone(),
            executor,
            config.topology_change_delay(),
        );
        let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(&topology) as Weak<dyn ConnectionObserver>;
        store.set_observer(observer);
        store.initialize();
        if store.is_empty() {
            tracing::error!(search_root = %config.search_root, "no pools configured, caller is not usable");
            return Err(CallerError::NoPoolsConfigured(config.search_root.clone()));
        }

        let mapper = TransactionPoolMapper::new(config.transaction_sticky, tx_manager);
        let lookup: Arc<dyn ServiceLookup> = Arc::new(LookupService::new(
            store.clone(),
            cache.clone(),
            Lookup,
            tx_less.clone(),
        ));
        let failed_discovery = FailedDiscoveryHandler::new(store.clone(), repopulator.clone());
        let caller = Caller::new(
            lookup,
            FailoverAlgorithm::new(mapper.clone()),
            tx_less,
            failed_discovery,
        );

        let validator = Arc::new(ConnectionValidator::new(store.clone(), repopulator));
        let validation = Arc::new(ValidationWork::new(validator));
        let timer = ValidationTimer::start(validation.clone(), config.validation_interval())
            .map_err(|e| CallerError::Internal(format!("failed to start validation timer: {e}")))?;

        tracing::info!(
            search_root = %config.search_root,
            pools = store.len(),
            transaction_sticky = config.transaction_sticky,
            "caller runtime started"
        );

        Ok(Self {
            config,
            caller,
            store,
            cache,
            mapper,
            topology,
            scheduler: None,
            validation,
            timer: Some(timer),
        })
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn config(&self) -> &CallerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PoolEntryStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    pub fn mapper(&self) -> &Arc<TransactionPoolMapper> {
        &self.mapper
    }

    pub fn topology(&self) -> &Arc<TopologyChangeHandler> {
        &self.topology
    }

    /// Run a validation pass now on the calling thread. `None` if a pass is
    /// already running.
    pub fn validate_now(&self) -> Option<ValidationReport> {
        self.validation.work()
    }

    /// Validation passes completed so far, timer and manual.
    pub fn validation_runs(&self) -> u64 {
        self.validation.runs()
    }

    pub fn is_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| t.is_running())
    }

    /// Stop the validation timer and the topology scheduler. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        tracing::info!(search_root = %self.config.search_root, "caller runtime stopped");
    }
}

impl Drop for CallerRuntime {
    fn drop(&mut self) {
        if self.timer.is_some() || self.scheduler.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDomain, FakePoolFinder, ManualScheduler};
    use crate::txn::{LocalTransactionManager, NoTransactionManager};
    use tproute_common::error::TransportError;

    fn make_config() -> CallerConfig {
        CallerConfig {
            validation_interval_ms: 60_000,
            ..CallerConfig::default()
        }
    }

    fn make_runtime(domains: &[(&str, &FakeDomain)]) -> CallerRuntime {
        let finder = FakePoolFinder::new();
        for (name, domain) in domains {
            finder.add(name, domain);
        }
        let runtime = CallerRuntime::start_with_executor(
            make_config(),
            finder,
            Arc::new(NoTransactionManager),
            ManualScheduler::new(),
        )
        .unwrap();
        wait_for_first_validation(&runtime);
        runtime
    }

    // The timer's first pass runs at start; let it finish so connection
    // counters are quiet.
    fn wait_for_first_validation(runtime: &CallerRuntime) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while runtime.validation_runs() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_without_pools_fails() {
        let err = CallerRuntime::start(make_config(), FakePoolFinder::new(), Arc::new(NoTransactionManager))
            .err()
            .unwrap();
        assert!(matches!(err, CallerError::NoPoolsConfigured(ref root) if root == "eis"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let finder = FakePoolFinder::new();
        finder.add("eis/a", &FakeDomain::new("a"));
        let config = CallerConfig {
            scheduler_capacity: 0,
            ..make_config()
        };
        let err = CallerRuntime::start(config, finder, Arc::new(NoTransactionManager))
            .err()
            .unwrap();
        assert!(matches!(err, CallerError::Config(_)));
    }

    #[test]
    fn test_tpcall_routes_to_serving_pool() {
        let a = FakeDomain::new("a");
        a.serve("echo", 0);
        let runtime = make_runtime(&[("eis/a", &a)]);
        let reply = runtime
            .caller()
            .tpcall("echo", &Buffer::new("X_OCTET", "hi"), Flags::empty())
            .unwrap();
        assert_eq!(reply.error_state, ErrorState::Ok);
        assert_eq!(reply.reply.type_name, "a");
        assert_eq!(a.open_connections(), 0);
        assert_eq!(runtime.caller().failover_metrics().calls, 1);
    }

    #[test]
    fn test_tpcall_unknown_service_is_not_found() {
        let a = FakeDomain::new("a");
        let runtime = make_runtime(&[("eis/a", &a)]);
        let reply = runtime.caller().tpcall("nope", &Buffer::empty(), Flags::empty()).unwrap();
        assert!(reply.is_not_found());
        assert!(!runtime.caller().service_exists("nope"));
    }

    #[test]
    fn test_tpacall_reply() {
        let a = FakeDomain::new("a");
        a.serve("echo", 0);
        let runtime = make_runtime(&[("eis/a", &a)]);
        let pending = runtime
            .caller()
            .tpacall("echo", &Buffer::new("X_OCTET", "hi"), Flags::empty())
            .unwrap();
        assert_eq!(pending.wait().unwrap().error_state, ErrorState::Ok);

        let missing = runtime.caller().tpacall("nope", &Buffer::empty(), Flags::empty()).unwrap();
        assert!(missing.wait().unwrap().is_not_found());
    }

    #[test]
    fn test_tpconnect_keeps_connection_open() {
        let a = FakeDomain::new("a");
        a.serve("chat", 0);
        let runtime = make_runtime(&[("eis/a", &a)]);
        let conversation = runtime
            .caller()
            .tpconnect("chat", &Buffer::empty(), Flags::empty())
            .unwrap();
        assert_eq!(conversation.error_state, ErrorState::Ok);
        assert!(conversation.connection.is_some());
        assert_eq!(a.open_connections(), 1);
        conversation.close();
        assert_eq!(a.open_connections(), 0);

        let missing = runtime
            .caller()
            .tpconnect("nope", &Buffer::empty(), Flags::empty())
            .unwrap();
        assert_eq!(missing.error_state, ErrorState::Tpenoent);
        assert!(missing.connection.is_none());
    }

    #[test]
    fn test_queue_round_trip_and_not_found() {
        let a = FakeDomain::new("a");
        a.add_queue("orders");
        let runtime = make_runtime(&[("eis/a", &a)]);
        let caller = runtime.caller();
        let queue = QueueInfo::new("orders");
        assert!(caller.queue_exists(&queue));

        let enqueued = caller
            .enqueue(&queue, &QueueMessage::new(Buffer::new("X_OCTET", "m1")))
            .unwrap();
        assert_eq!(enqueued.error_state, ErrorState::Ok);
        assert_eq!(a.queue_depth("orders"), 1);

        let dequeued = caller.dequeue(&queue, &MessageSelector::default()).unwrap();
        assert_eq!(dequeued.messages.len(), 1);
        assert_eq!(a.queue_depth("orders"), 0);

        let missing = QueueInfo::new("missing");
        assert!(!caller.queue_exists(&missing));
        assert_eq!(
            caller.enqueue(&missing, &QueueMessage::new(Buffer::empty())).unwrap().error_state,
            ErrorState::Tpenoent
        );
        assert_eq!(
            caller.dequeue(&missing, &MessageSelector::default()).unwrap().error_state,
            ErrorState::Tpenoent
        );
    }

    #[test]
    fn test_enqueue_transport_failure_is_surfaced() {
        let a = FakeDomain::new("a");
        a.add_queue("orders");
        let runtime = make_runtime(&[("eis/a", &a)]);
        let queue = QueueInfo::new("orders");
        assert!(runtime.caller().queue_exists(&queue));
        a.set_reachable(false);
        let err = runtime
            .caller()
            .enqueue(&queue, &QueueMessage::new(Buffer::empty()))
            .unwrap_err();
        assert!(matches!(err, CallerError::Transport(ref e) if e.is_retryable()));
    }

    #[test]
    fn test_service_details_unsupported() {
        let a = FakeDomain::new("a");
        let runtime = make_runtime(&[("eis/a", &a)]);
        let err = runtime.caller().service_details("echo").unwrap_err();
        assert!(matches!(err, CallerError::Unsupported(_)));
    }

    #[test]
    fn test_tpnotran_suspends_transaction() {
        let a = FakeDomain::new("a");
        a.serve("echo", 0);
        let finder = FakePoolFinder::new();
        finder.add("eis/a", &a);
        let tm = LocalTransactionManager::new();
        let config = CallerConfig {
            transaction_sticky: true,
            ..make_config()
        };
        let runtime =
            CallerRuntime::start_with_executor(config, finder, tm.clone(), ManualScheduler::new()).unwrap();
        wait_for_first_validation(&runtime);
        let txn = tm.begin().unwrap();

        runtime
            .caller()
            .tpcall("echo", &Buffer::empty(), Flags::of(Flags::TPNOTRAN))
            .unwrap();
        assert_eq!(runtime.mapper().tracked_count(), 0);
        assert_eq!(tm.current(), Some(txn));

        runtime.caller().tpcall("echo", &Buffer::empty(), Flags::empty()).unwrap();
        assert_eq!(runtime.mapper().tracked_count(), 1);
        tm.commit().unwrap();
        assert_eq!(runtime.mapper().tracked_count(), 0);
    }

    #[test]
    fn test_flagged_pool_is_rediscovered_before_call() {
        let a = FakeDomain::new("a");
        a.serve("echo", 3);
        let runtime = make_runtime(&[("eis/a", &a)]);
        runtime.caller().tpcall("echo", &Buffer::empty(), Flags::empty()).unwrap();
        assert_eq!(runtime.cache().get("echo").priorities(), vec![3]);

        a.stop_serving("echo");
        a.serve("echo", 1);
        runtime.store().get()[0].set_needs_domain_discovery(true);
        runtime.caller().tpcall("echo", &Buffer::empty(), Flags::empty()).unwrap();
        assert_eq!(a.discovery_count(), 1);
        assert_eq!(runtime.cache().get("echo").priorities(), vec![1]);
    }

    #[test]
    fn test_validate_now_and_shutdown() {
        let a = FakeDomain::new("a");
        let mut runtime = make_runtime(&[("eis/a", &a)]);
        let report = runtime.validate_now().unwrap();
        assert_eq!(report.checked, 1);
        assert!(runtime.is_running());
        runtime.shutdown();
        assert!(!runtime.is_running());
        runtime.shutdown();
    }

    #[test]
    fn test_unreachable_pool_fails_over_at_runtime() {
        let a = FakeDomain::new("a");
        let b = FakeDomain::new("b");
        a.serve("echo", 0);
        b.serve("echo", 0);
        let runtime = make_runtime(&[("eis/a", &a), ("eis/b", &b)]);
        a.fail_next_call(TransportError::unreachable("gone"));
        b.fail_next_call(TransportError::unreachable("gone"));
        let err = runtime
            .caller()
            .tpcall("echo", &Buffer::empty(), Flags::empty())
            .unwrap_err();
        assert!(matches!(err, CallerError::AllPoolsFailed { attempted: 2, .. }));
        assert!(err.is_retryable());
    }
}
