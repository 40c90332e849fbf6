//! Topology-change handling.
//!
//! A domain announcing a topology change gets its pool's cache entries
//! rebuilt after a short delay. Notifications are debounced per domain:
//!
//! ```text
//!   Idle ──notify──▶ Pending ──task done, no update──▶ Idle
//!                      │  ▲
//!             notify   │  │ task done, update arrived: reschedule
//!                      ▼  │
//!               Pending(update arrived)
//! ```
//!
//! When the executor refuses the task the domain goes back to Idle and its
//! pool is flagged for rediscovery on the next ordinary call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use tproute_common::crash_domain::run_guarded;
use tproute_common::types::DomainId;

use crate::pool::PoolEntry;
use crate::pool_store::PoolEntryStore;
use crate::repopulate::CacheRepopulator;
use crate::scheduler::DelayedExecutor;
use crate::transport::ConnectionObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Idle,
    Pending { update_arrived: bool },
}

/// True if `pool` currently connects to `domain`. Costs one round trip;
/// an unreachable pool never matches.
pub fn is_same_domain(domain: &DomainId, pool: &PoolEntry) -> bool {
    let result = pool.connection().and_then(|mut con| con.domain_id());
    match result {
        Ok(id) => id == *domain,
        Err(e) => {
            tracing::warn!(
                domain = %domain,
                pool = %pool.name(),
                error = %e,
                "failed comparing domain id, connection most likely gone"
            );
            false
        }
    }
}

pub struct TopologyChangeHandler {
    me: Weak<TopologyChangeHandler>,
    store: Arc<PoolEntryStore>,
    repopulator: Arc<CacheRepopulator>,
    executor: Arc<dyn DelayedExecutor>,
    delay: Duration,
    /// Pending domains; the flag records an update that arrived meanwhile.
    pending: Mutex<HashMap<DomainId, bool>>,
    tasks_run: AtomicU64,
}

impl TopologyChangeHandler {
    pub fn new(
        store: Arc<PoolEntryStore>,
        repopulator: Arc<CacheRepopulator>,
        executor: Arc<dyn DelayedExecutor>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            repopulator,
            executor,
            delay,
            pending: Mutex::new(HashMap::new()),
            tasks_run: AtomicU64::new(0),
        })
    }

    pub fn state(&self, domain: &DomainId) -> TopologyState {
        match self.pending.lock().get(domain) {
            Some(update_arrived) => TopologyState::Pending {
                update_arrived: *update_arrived,
            },
            None => TopologyState::Idle,
        }
    }

    /// Discovery tasks executed so far.
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.load(Ordering::Relaxed)
    }

    pub fn on_topology_changed(&self, domain: DomainId) {
        {
            let mut pending = self.pending.lock();
            if let Some(update_arrived) = pending.get_mut(&domain) {
                *update_arrived = true;
                tracing::debug!(domain = %domain, "topology update arrived during discovery");
                return;
            }
            pending.insert(domain.clone(), false);
        }
        self.schedule_discovery(domain);
    }

    fn schedule_discovery(&self, domain: DomainId) {
        tracing::debug!(domain = %domain, delay_ms = self.delay.as_millis() as u64, "scheduling domain discovery");
        let me = self.me.clone();
        let task_domain = domain.clone();
        let scheduled = self.executor.schedule(
            self.delay,
            Box::new(move || {
                if let Some(handler) = me.upgrade() {
                    handler.run_discovery(task_domain);
                }
            }),
        );
        if let Err(e) = scheduled {
            self.pending.lock().remove(&domain);
            tracing::warn!(
                domain = %domain,
                error = %e,
                "could not schedule topology change handling, deferring to the next call"
            );
            self.mark_for_later_discovery(&domain);
        }
    }

    fn run_discovery(&self, domain: DomainId) {
        let context = format!("domain={domain}");
        run_guarded("topology_discovery", &context, || {
            match self.find_pool(&domain) {
                Some(pool) => {
                    tracing::debug!(domain = %domain, pool = %pool.name(), "issuing domain discovery");
                    self.repopulator.repopulate(&pool);
                }
                // Gone; it repopulates on reconnect.
                None => tracing::debug!(domain = %domain, "no pool matches domain"),
            }
            Ok(())
        });
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
        self.finish(domain);
    }

    fn finish(&self, domain: DomainId) {
        let reschedule = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&domain) {
                Some(update_arrived) if *update_arrived => {
                    *update_arrived = false;
                    true
                }
                _ => {
                    pending.remove(&domain);
                    false
                }
            }
        };
        if reschedule {
            self.schedule_discovery(domain);
        } else {
            tracing::debug!(domain = %domain, "topology change handled");
        }
    }

    fn find_pool(&self, domain: &DomainId) -> Option<Arc<PoolEntry>> {
        self.store
            .get()
            .into_iter()
            .find(|pool| is_same_domain(domain, pool))
    }

    fn mark_for_later_discovery(&self, domain: &DomainId) {
        if let Some(pool) = self.find_pool(domain) {
            pool.set_needs_domain_discovery(true);
        }
    }
}

impl ConnectionObserver for TopologyChangeHandler {
    fn topology_changed(&self, domain: DomainId) {
        self.on_topology_changed(domain);
    }
}
