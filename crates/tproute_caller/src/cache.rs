//! Discovery cache.
//!
//! `PoolsByPriority` is the cached routing answer for one service: pools by
//! hop count plus the set of pools already asked. `DiscoveryCache` maps
//! every known service and queue name to its answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use rand::seq::{IndexedRandom, SliceRandom};

use tproute_common::types::{DiscoveryResult, PoolName, Priority, ServiceDetails};

use crate::pool::PoolEntry;
use crate::priority::PriorityCollection;

/// Pools serving one service, by priority, plus the pools already queried.
///
/// An entry with no pools but a non-empty resolved set means every queried
/// pool answered "not here".
#[derive(Debug, Default)]
pub struct PoolsByPriority {
    pools: PriorityCollection<Arc<PoolEntry>>,
    resolved: DashSet<PoolName>,
}

impl PoolsByPriority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an entry from explicit tiers and resolved names.
    pub fn of<I, R>(tiers: I, resolved: R) -> Self
    where
        I: IntoIterator<Item = (Priority, Vec<Arc<PoolEntry>>)>,
        R: IntoIterator<Item = PoolName>,
    {
        let entry = Self::new();
        for (priority, pools) in tiers {
            entry.store_tier(priority, pools);
        }
        entry.add_resolved(resolved);
        entry
    }

    /// Record the routes `pool` reported. Each route's hop count is a tier.
    pub fn store(&self, details: &[ServiceDetails], pool: &Arc<PoolEntry>) {
        if details.is_empty() {
            return;
        }
        self.resolved.insert(pool.name().clone());
        for route in details {
            self.pools.add(route.hops, pool.clone());
        }
    }

    pub fn store_tier(&self, priority: Priority, pools: Vec<Arc<PoolEntry>>) {
        self.pools.add_all(priority, pools);
    }

    pub fn priorities(&self) -> Vec<Priority> {
        self.pools.priorities()
    }

    pub fn tier(&self, priority: Priority) -> Vec<Arc<PoolEntry>> {
        self.pools.get(priority)
    }

    /// Flatten the tiers lowest first, shuffling inside each tier. A pool
    /// present in several tiers is returned once, at its best tier.
    pub fn randomize_with_priority(&self) -> Vec<Arc<PoolEntry>> {
        let mut rng = rand::rng();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for priority in self.pools.priorities() {
            let mut tier = self.pools.get(priority);
            tier.shuffle(&mut rng);
            for pool in tier {
                if seen.insert(pool.name().clone()) {
                    out.push(pool);
                }
            }
        }
        out
    }

    pub fn is_resolved(&self, name: &PoolName) -> bool {
        self.resolved.contains(name)
    }

    pub fn set_resolved(&self, name: PoolName) {
        self.resolved.insert(name);
    }

    pub fn add_resolved<R>(&self, names: R)
    where
        R: IntoIterator<Item = PoolName>,
    {
        for name in names {
            self.resolved.insert(name);
        }
    }

    pub fn resolved(&self) -> Vec<PoolName> {
        self.resolved.iter().map(|n| n.key().clone()).collect()
    }

    pub fn contains_resolved(&self) -> bool {
        !self.resolved.is_empty()
    }

    /// True iff every usable pool in `pools` has already been queried.
    pub fn has_checked_all_valid(&self, pools: &[Arc<PoolEntry>]) -> bool {
        pools
            .iter()
            .all(|pool| pool.is_invalid() || self.resolved.contains(pool.name()))
    }

    pub fn remove(&self, pool: &Arc<PoolEntry>) {
        self.resolved.remove(pool.name());
        self.pools.remove(pool);
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn merge(&self, other: &PoolsByPriority) {
        for priority in other.priorities() {
            self.store_tier(priority, other.tier(priority));
        }
        self.add_resolved(other.resolved());
    }
}

/// Every known service and queue name, as sent along with a domain
/// discovery request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedNames {
    pub services: Vec<String>,
    pub queues: Vec<String>,
}

impl CachedNames {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.queues.is_empty()
    }
}

/// Process-wide routing cache.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    services: DashMap<String, Arc<PoolsByPriority>>,
    queues: DashMap<String, Vec<Arc<PoolEntry>>>,
}

impl DiscoveryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cached entry for `service`; an empty entry when nothing is cached.
    pub fn get(&self, service: &str) -> Arc<PoolsByPriority> {
        self.services
            .get(service)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Merge `entry` into whatever is cached for `service`.
    pub fn store(&self, service: &str, entry: &PoolsByPriority) {
        let cached = self
            .services
            .entry(service.to_string())
            .or_default()
            .value()
            .clone();
        cached.merge(entry);
        tracing::debug!(service = service, tiers = ?cached.priorities(), "service cache updated");
    }

    pub fn remove_service(&self, service: &str) {
        if self.services.remove(service).is_some() {
            tracing::debug!(service = service, "service evicted from cache");
        }
    }

    /// A random usable pool among those cached for `queue`.
    pub fn get_queue_pool(&self, queue: &str) -> Option<Arc<PoolEntry>> {
        let usable: Vec<Arc<PoolEntry>> = self
            .queues
            .get(queue)?
            .iter()
            .filter(|pool| pool.is_valid())
            .cloned()
            .collect();
        usable.choose(&mut rand::rng()).cloned()
    }

    pub fn store_queue(&self, queue: &str, pools: Vec<Arc<PoolEntry>>) {
        let mut cached = self.queues.entry(queue.to_string()).or_default();
        for pool in pools {
            if !cached.contains(&pool) {
                cached.push(pool);
            }
        }
    }

    pub fn remove_queue(&self, queue: &str) {
        self.queues.remove(queue);
    }

    pub fn snapshot_names(&self) -> CachedNames {
        CachedNames {
            services: self.services.iter().map(|e| e.key().clone()).collect(),
            queues: self.queues.iter().map(|e| e.key().clone()).collect(),
        }
    }

    /// Forget every route through `pool`.
    pub fn purge(&self, pool: &Arc<PoolEntry>) {
        for entry in self.services.iter() {
            entry.value().remove(pool);
        }
        for mut entry in self.queues.iter_mut() {
            entry.value_mut().retain(|p| p.name() != pool.name());
        }
        self.queues.retain(|_, pools| !pools.is_empty());
        tracing::debug!(pool = %pool.name(), "pool purged from cache");
    }

    /// Add the routes `pool` reported in a domain discovery.
    pub fn repopulate(&self, discovery: &DiscoveryResult, pool: &Arc<PoolEntry>) {
        let mut by_service: HashMap<&str, Vec<ServiceDetails>> = HashMap::new();
        for route in &discovery.services {
            by_service
                .entry(route.name.as_str())
                .or_default()
                .push(route.clone());
        }
        for (service, routes) in by_service {
            let entry = PoolsByPriority::new();
            entry.store(&routes, pool);
            self.store(service, &entry);
        }
        for queue in &discovery.queues {
            self.store_queue(&queue.name, vec![pool.clone()]);
        }
        tracing::info!(
            pool = %pool.name(),
            services = discovery.services.len(),
            queues = discovery.queues.len(),
            "cache repopulated from domain discovery"
        );
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
