//! Pool entry store: the set of configured pools under the search root.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use tproute_common::types::DomainId;

use crate::pool::PoolEntry;
use crate::transport::{ConnectionObserver, PoolFinder};

/// Forwards topology notifications to the registered observer without
/// keeping it alive.
struct ObserverRelay {
    target: Weak<dyn ConnectionObserver>,
}

impl ConnectionObserver for ObserverRelay {
    fn topology_changed(&self, domain: DomainId) {
        match self.target.upgrade() {
            Some(target) => target.topology_changed(domain),
            None => tracing::debug!(domain = %domain, "topology change dropped, observer is gone"),
        }
    }
}

pub struct PoolEntryStore {
    finder: Arc<dyn PoolFinder>,
    search_root: String,
    pools: RwLock<Vec<Arc<PoolEntry>>>,
    init_lock: Mutex<()>,
    relay: RwLock<Option<Arc<ObserverRelay>>>,
}

impl PoolEntryStore {
    /// Create an empty store. Pools are enumerated on `initialize` or on
    /// first access.
    pub fn new(finder: Arc<dyn PoolFinder>, search_root: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            finder,
            search_root: search_root.into(),
            pools: RwLock::new(Vec::new()),
            init_lock: Mutex::new(()),
            relay: RwLock::new(None),
        })
    }

    pub fn search_root(&self) -> &str {
        &self.search_root
    }

    /// Route topology notifications from every pool's connections to
    /// `observer`.
    pub fn set_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        *self.relay.write() = Some(Arc::new(ObserverRelay { target: observer }));
    }

    /// All configured pools. An empty store re-enumerates first.
    pub fn get(&self) -> Vec<Arc<PoolEntry>> {
        {
            let pools = self.pools.read();
            if !pools.is_empty() {
                return pools.clone();
            }
        }
        self.initialize();
        let pools = self.pools.read().clone();
        if pools.is_empty() {
            tracing::warn!(
                search_root = %self.search_root,
                "no pools found, routing is unavailable until pools are configured; will retry on next access"
            );
        }
        pools
    }

    /// Enumerate pools via the finder, validate each one and register the
    /// topology observer on it. A store that already holds pools is left
    /// untouched.
    pub fn initialize(&self) {
        let _init = self.init_lock.lock();
        if !self.pools.read().is_empty() {
            return;
        }
        let descriptors = self.finder.find(&self.search_root);
        let pools: Vec<Arc<PoolEntry>> = descriptors
            .into_iter()
            .map(|d| PoolEntry::new(d.name, d.factory))
            .collect();
        tracing::info!(
            search_root = %self.search_root,
            pools = pools.len(),
            valid = pools.iter().filter(|p| p.is_valid()).count(),
            "pool store initialized"
        );
        *self.pools.write() = pools.clone();
        for pool in &pools {
            self.add_connection_observer(pool);
        }
    }

    /// Register the topology observer on `pool`. Invalid pools are skipped
    /// and failures ignored; both are retried when the pool reconnects.
    pub fn add_connection_observer(&self, pool: &PoolEntry) {
        if pool.is_invalid() {
            tracing::debug!(pool = %pool.name(), "pool invalid, observer registration deferred");
            return;
        }
        let Some(relay) = self.relay.read().clone() else {
            return;
        };
        match pool.connection() {
            Ok(mut con) => con.add_connection_observer(relay),
            Err(e) => {
                tracing::debug!(pool = %pool.name(), error = %e, "observer registration failed, deferred");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}
