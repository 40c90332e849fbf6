//! In-memory backend for tests and local experiments.
//!
//! A [`FakeDomain`] plays one backend domain: it serves scripted services at
//! scripted hop counts, holds queues, answers discovery and domain-identity
//! queries, and can be told to fail. Every connection handed out by its
//! factory talks to the same shared state, and the counters record what the
//! router actually did to it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use tproute_common::error::TransportError;
use tproute_common::types::{
    Buffer, DequeueReturn, DiscoveryResult, DomainId, EnqueueReturn, ErrorState, Flags,
    MessageSelector, Priority, QueueDetails, QueueInfo, QueueMessage, ServiceDetails,
    ServiceReturn,
};

use crate::scheduler::{DelayedExecutor, ScheduleError, Task};
use crate::transport::{
    Connection, ConnectionFactory, ConnectionListener, ConnectionObserver, PendingReply,
    PoolDescriptor, PoolFinder, TransportResult,
};

type DiscoverHook = Arc<dyn Fn(&DomainId) + Send + Sync>;

struct DomainState {
    id: DomainId,
    reachable: AtomicBool,
    services: Mutex<HashMap<String, Vec<Priority>>>,
    queues: Mutex<HashMap<String, Vec<QueueMessage>>>,
    call_failures: Mutex<VecDeque<TransportError>>,
    lookup_failure: Mutex<Option<TransportError>>,
    discover_failure: Mutex<Option<TransportError>>,
    on_discover: Mutex<Option<DiscoverHook>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
    executions: Mutex<Vec<Uuid>>,
    calls: AtomicUsize,
    discoveries: AtomicUsize,
    lookups: AtomicUsize,
    domain_id_queries: AtomicUsize,
    connections_opened: AtomicUsize,
    open_connections: AtomicI64,
}

/// Scripted backend domain. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FakeDomain {
    state: Arc<DomainState>,
}

impl FakeDomain {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(DomainState {
                id: DomainId::random(name),
                reachable: AtomicBool::new(true),
                services: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                call_failures: Mutex::new(VecDeque::new()),
                lookup_failure: Mutex::new(None),
                discover_failure: Mutex::new(None),
                on_discover: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                executions: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                discoveries: AtomicUsize::new(0),
                lookups: AtomicUsize::new(0),
                domain_id_queries: AtomicUsize::new(0),
                connections_opened: AtomicUsize::new(0),
                open_connections: AtomicI64::new(0),
            }),
        }
    }

    pub fn id(&self) -> DomainId {
        self.state.id.clone()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(FakeFactory {
            state: self.state.clone(),
        })
    }

    // ── Scripting ───────────────────────────────────────────────────────

    /// Serve `service` at `hops`. Calling again adds another route.
    pub fn serve(&self, service: &str, hops: Priority) -> &Self {
        self.state
            .services
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(hops);
        self
    }

    pub fn stop_serving(&self, service: &str) {
        self.state.services.lock().remove(service);
    }

    pub fn add_queue(&self, queue: &str) -> &Self {
        self.state.queues.lock().entry(queue.to_string()).or_default();
        self
    }

    pub fn remove_queue(&self, queue: &str) {
        self.state.queues.lock().remove(queue);
    }

    /// An unreachable domain refuses new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next call (tpcall, tpacall or tpconnect) with `err`.
    pub fn fail_next_call(&self, err: TransportError) {
        self.state.call_failures.lock().push_back(err);
    }

    /// Fail every service-details and queue-exists query while set.
    pub fn fail_lookups(&self, err: Option<TransportError>) {
        *self.state.lookup_failure.lock() = err;
    }

    /// Fail every discovery while set.
    pub fn fail_discovery(&self, err: Option<TransportError>) {
        *self.state.discover_failure.lock() = err;
    }

    /// Invoke `hook` at the start of every discovery.
    pub fn on_discover<F>(&self, hook: F)
    where
        F: Fn(&DomainId) + Send + Sync + 'static,
    {
        *self.state.on_discover.lock() = Some(Arc::new(hook));
    }

    // ── Notifications ───────────────────────────────────────────────────

    pub fn announce_disconnecting(&self) {
        let listeners = self.state.listeners.lock().clone();
        for listener in listeners {
            listener.connection_disabled();
        }
    }

    pub fn announce_enabled(&self) {
        let listeners = self.state.listeners.lock().clone();
        for listener in listeners {
            listener.connection_enabled();
        }
    }

    pub fn announce_topology_changed(&self) {
        let observers = self.state.observers.lock().clone();
        for observer in observers {
            observer.topology_changed(self.state.id.clone());
        }
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub fn listener_count(&self) -> usize {
        self.state.listeners.lock().len()
    }

    pub fn observer_count(&self) -> usize {
        self.state.observers.lock().len()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn discovery_count(&self) -> usize {
        self.state.discoveries.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.state.lookups.load(Ordering::SeqCst)
    }

    pub fn domain_id_query_count(&self) -> usize {
        self.state.domain_id_queries.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Connections checked out and not yet released.
    pub fn open_connections(&self) -> i64 {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Execution ids seen by calls, in arrival order.
    pub fn executions(&self) -> Vec<Uuid> {
        self.state.executions.lock().clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.queues.lock().get(queue).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for FakeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDomain").field("id", &self.state.id).finish()
    }
}

struct FakeFactory {
    state: Arc<DomainState>,
}

impl ConnectionFactory for FakeFactory {
    fn connection(&self) -> TransportResult<Box<dyn Connection>> {
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::unreachable(format!(
                "domain {} is unreachable",
                self.state.id.name
            )));
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<DomainState>,
}

impl FakeConnection {
    fn begin_call(&self, execution: Uuid) -> TransportResult<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.executions.lock().push(execution);
        match self.state.call_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn serves(&self, service: &str) -> bool {
        self.state.services.lock().contains_key(service)
    }

    fn reply(&self, service: &str, data: &Buffer) -> ServiceReturn {
        if self.serves(service) {
            ServiceReturn::success(Buffer::new(self.state.id.name.clone(), data.payload.clone()))
        } else {
            ServiceReturn::not_found()
        }
    }

    fn check_lookup(&self) -> TransportResult<()> {
        self.state.lookups.fetch_add(1, Ordering::SeqCst);
        match self.state.lookup_failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Connection for FakeConnection {
    fn tpcall(
        &mut self,
        service: &str,
        data: &Buffer,
        _flags: Flags,
        execution: Uuid,
    ) -> TransportResult<ServiceReturn> {
        self.begin_call(execution)?;
        Ok(self.reply(service, data))
    }

    fn tpacall(
        &mut self,
        service: &str,
        data: &Buffer,
        _flags: Flags,
        execution: Uuid,
    ) -> TransportResult<PendingReply> {
        self.begin_call(execution)?;
        Ok(PendingReply::ready(Ok(self.reply(service, data))))
    }

    fn tpconnect(&mut self, service: &str, _data: &Buffer, _flags: Flags) -> TransportResult<ErrorState> {
        self.begin_call(Uuid::nil())?;
        Ok(if self.serves(service) {
            ErrorState::Ok
        } else {
            ErrorState::Tpenoent
        })
    }

    fn discover(
        &mut self,
        _execution: Uuid,
        services: &[String],
        queues: &[String],
    ) -> TransportResult<DiscoveryResult> {
        self.state.discoveries.fetch_add(1, Ordering::SeqCst);
        let hook = self.state.on_discover.lock().clone();
        if let Some(hook) = hook {
            hook(&self.state.id);
        }
        if let Some(err) = self.state.discover_failure.lock().clone() {
            return Err(err);
        }
        let served = self.state.services.lock();
        let found_services = services
            .iter()
            .filter_map(|name| served.get(name).map(|hops| (name, hops)))
            .flat_map(|(name, hops)| hops.iter().map(move |h| ServiceDetails::new(name.clone(), *h)))
            .collect();
        let known_queues = self.state.queues.lock();
        let found_queues = queues
            .iter()
            .filter(|name| known_queues.contains_key(*name))
            .map(|name| QueueDetails {
                name: name.clone(),
                retries: 0,
            })
            .collect();
        Ok(DiscoveryResult {
            services: found_services,
            queues: found_queues,
        })
    }

    fn service_details(&mut self, service: &str) -> TransportResult<Vec<ServiceDetails>> {
        self.check_lookup()?;
        Ok(self
            .state
            .services
            .lock()
            .get(service)
            .map(|hops| hops.iter().map(|h| ServiceDetails::new(service, *h)).collect())
            .unwrap_or_default())
    }

    fn queue_exists(&mut self, queue: &QueueInfo) -> TransportResult<bool> {
        self.check_lookup()?;
        Ok(self.state.queues.lock().contains_key(&queue.name))
    }

    fn enqueue(&mut self, queue: &QueueInfo, message: &QueueMessage) -> TransportResult<EnqueueReturn> {
        let mut queues = self.state.queues.lock();
        match queues.get_mut(&queue.name) {
            Some(messages) => {
                messages.push(message.clone());
                Ok(EnqueueReturn {
                    message_id: Some(message.id),
                    error_state: ErrorState::Ok,
                })
            }
            None => Ok(EnqueueReturn::not_found()),
        }
    }

    fn dequeue(&mut self, queue: &QueueInfo, selector: &MessageSelector) -> TransportResult<DequeueReturn> {
        let mut queues = self.state.queues.lock();
        let Some(messages) = queues.get_mut(&queue.name) else {
            return Ok(DequeueReturn::not_found());
        };
        let matches = |m: &QueueMessage| {
            selector.message_id.map_or(true, |id| id == m.id)
                && selector
                    .correlation
                    .as_ref()
                    .map_or(true, |c| m.correlation.as_ref() == Some(c))
        };
        let position = messages.iter().position(matches);
        Ok(DequeueReturn {
            messages: position.map(|i| messages.remove(i)).into_iter().collect(),
            error_state: ErrorState::Ok,
        })
    }

    fn domain_id(&mut self) -> TransportResult<DomainId> {
        self.state.domain_id_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.id.clone())
    }

    fn add_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.state.listeners.lock().push(listener);
    }

    fn add_connection_observer(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.state.observers.lock().push(observer);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool enumeration over an explicit, mutable list.
#[derive(Default)]
pub struct FakePoolFinder {
    pools: Mutex<Vec<PoolDescriptor>>,
    finds: AtomicUsize,
}

impl FakePoolFinder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, name: &str, domain: &FakeDomain) {
        self.pools.lock().push(PoolDescriptor {
            name: name.to_string(),
            factory: domain.factory(),
        });
    }

    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

impl PoolFinder for FakePoolFinder {
    fn find(&self, search_root: &str) -> Vec<PoolDescriptor> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.pools
            .lock()
            .iter()
            .filter(|p| p.name.starts_with(search_root))
            .cloned()
            .collect()
    }
}

/// Delayed executor driven by hand. Tasks run only when the test says so.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<VecDeque<(Duration, Task)>>,
    rejecting: AtomicBool,
    accepted: AtomicUsize,
    executed: AtomicUsize,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While set, every `schedule` fails as saturated.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Delay of the oldest pending task.
    pub fn next_delay(&self) -> Option<Duration> {
        self.pending.lock().front().map(|(d, _)| *d)
    }

    /// Run the oldest pending task. Returns false when nothing was pending.
    pub fn run_next(&self) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some((_, task)) => {
                task();
                self.executed.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Run tasks until none are pending, including ones scheduled by tasks.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl DelayedExecutor for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(ScheduleError::Saturated { capacity: 0 });
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back((delay, task));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tproute_common::error::TransportErrorKind;

    #[test]
    fn test_connections_are_released_on_drop() {
        let domain = FakeDomain::new("a");
        let factory = domain.factory();
        let con = factory.connection().unwrap();
        assert_eq!(domain.open_connections(), 1);
        drop(con);
        assert_eq!(domain.open_connections(), 0);
        assert_eq!(domain.connections_opened(), 1);
    }

    #[test]
    fn test_scripted_call_failure_applies_once() {
        let domain = FakeDomain::new("a");
        domain.serve("echo", 0);
        domain.fail_next_call(TransportError::unreachable("down"));
        let mut con = domain.factory().connection().unwrap();
        let err = con
            .tpcall("echo", &Buffer::empty(), Flags::empty(), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unreachable);
        let ok = con
            .tpcall("echo", &Buffer::empty(), Flags::empty(), Uuid::new_v4())
            .unwrap();
        assert_eq!(ok.reply.type_name, domain.id().name);
        assert_eq!(domain.call_count(), 2);
    }

    #[test]
    fn test_discover_filters_known_names() {
        let domain = FakeDomain::new("a");
        domain.serve("s1", 0).serve("s1", 2).add_queue("q1");
        let mut con = domain.factory().connection().unwrap();
        let result = con
            .discover(
                Uuid::new_v4(),
                &["s1".to_string(), "s2".to_string()],
                &["q1".to_string(), "q2".to_string()],
            )
            .unwrap();
        assert_eq!(result.services.len(), 2);
        assert_eq!(result.queues.len(), 1);
    }

    #[test]
    fn test_enqueue_dequeue() {
        let domain = FakeDomain::new("a");
        domain.add_queue("q");
        let mut con = domain.factory().connection().unwrap();
        let msg = QueueMessage::new(Buffer::new("X_OCTET", "hello"));
        let ret = con.enqueue(&QueueInfo::new("q"), &msg).unwrap();
        assert_eq!(ret.message_id, Some(msg.id));
        assert_eq!(domain.queue_depth("q"), 1);
        let out = con.dequeue(&QueueInfo::new("q"), &MessageSelector::default()).unwrap();
        assert_eq!(out.messages, vec![msg]);
        let missing = con.enqueue(&QueueInfo::new("nope"), &QueueMessage::new(Buffer::empty())).unwrap();
        assert_eq!(missing.error_state, ErrorState::Tpenoent);
    }

    #[test]
    fn test_manual_scheduler() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scheduler
            .schedule(Duration::from_millis(50), Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(50)));
        assert_eq!(scheduler.run_all(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        scheduler.set_rejecting(true);
        assert!(scheduler.schedule(Duration::ZERO, Box::new(|| {})).is_err());
    }
}
