//! Route discovery for services and queues.
//!
//! [`Lookup`] asks pools directly. [`LookupService`] fronts it with the
//! discovery cache and only asks pools that have not answered yet.

use std::sync::Arc;

use tproute_common::types::QueueInfo;

use crate::cache::{DiscoveryCache, PoolsByPriority};
use crate::pool::PoolEntry;
use crate::pool_store::PoolEntryStore;
use crate::txn::TransactionLess;

/// Direct, uncached lookups. A failing pool is logged and skipped; it stays
/// unresolved so the next lookup asks it again.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lookup;

impl Lookup {
    pub fn find_service(
        &self,
        service: &str,
        pools: &[Arc<PoolEntry>],
        tx_less: &TransactionLess,
    ) -> PoolsByPriority {
        let found = PoolsByPriority::new();
        for pool in pools {
            if found.is_resolved(pool.name()) {
                continue;
            }
            match tx_less.service_details(pool, service) {
                Ok(details) => {
                    found.store(&details, pool);
                    found.set_resolved(pool.name().clone());
                }
                Err(e) => {
                    tracing::warn!(
                        pool = %pool.name(),
                        service = service,
                        retryable = e.is_retryable(),
                        error = %e,
                        "skipping pool for service lookup"
                    );
                }
            }
        }
        found
    }

    pub fn find_queue(
        &self,
        queue: &QueueInfo,
        pools: &[Arc<PoolEntry>],
        tx_less: &TransactionLess,
    ) -> Vec<Arc<PoolEntry>> {
        let mut found = Vec::new();
        for pool in pools {
            match tx_less.queue_exists(pool, queue) {
                Ok(true) => found.push(pool.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        pool = %pool.name(),
                        queue = %queue.name,
                        retryable = e.is_retryable(),
                        error = %e,
                        "skipping pool for queue lookup"
                    );
                }
            }
        }
        found
    }
}

/// Candidate pools for a destination, best first.
pub trait ServiceLookup: Send + Sync {
    /// Pools serving `service`, ascending priority, shuffled within a tier.
    fn get_service(&self, service: &str) -> Vec<Arc<PoolEntry>>;

    /// One usable pool holding `queue`.
    fn get_queue(&self, queue: &QueueInfo) -> Option<Arc<PoolEntry>>;

    fn remove_from_service_cache(&self, service: &str);
}

pub struct LookupService {
    store: Arc<PoolEntryStore>,
    cache: Arc<DiscoveryCache>,
    lookup: Lookup,
    tx_less: TransactionLess,
}

impl LookupService {
    pub fn new(
        store: Arc<PoolEntryStore>,
        cache: Arc<DiscoveryCache>,
        lookup: Lookup,
        tx_less: TransactionLess,
    ) -> Self {
        Self {
            store,
            cache,
            lookup,
            tx_less,
        }
    }
}

impl ServiceLookup for LookupService {
    fn get_service(&self, service: &str) -> Vec<Arc<PoolEntry>> {
        let pools = self.store.get();
        let cached = self.cache.get(service);
        if !cached.is_empty() && cached.has_checked_all_valid(&pools) {
            return cached.randomize_with_priority();
        }

        let unresolved: Vec<Arc<PoolEntry>> = pools
            .into_iter()
            .filter(|pool| !cached.is_resolved(pool.name()))
            .collect();
        let found = self.lookup.find_service(service, &unresolved, &self.tx_less);
        if !found.is_empty() || found.contains_resolved() {
            self.cache.store(service, &found);
            return self.cache.get(service).randomize_with_priority();
        }

        // Nothing answered; a stale list still tells the caller the service
        // has known routes, even if none of them is reachable right now.
        if cached.is_empty() {
            Vec::new()
        } else {
            cached.randomize_with_priority()
        }
    }

    fn get_queue(&self, queue: &QueueInfo) -> Option<Arc<PoolEntry>> {
        if let Some(pool) = self.cache.get_queue_pool(&queue.name) {
            return Some(pool);
        }
        let found = self.lookup.find_queue(queue, &self.store.get(), &self.tx_less);
        if !found.is_empty() {
            self.cache.store_queue(&queue.name, found);
        }
        self.cache.get_queue_pool(&queue.name)
    }

    fn remove_from_service_cache(&self, service: &str) {
        self.cache.remove_service(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDomain, FakePoolFinder};
    use crate::txn::NoTransactionManager;
    use tproute_common::error::TransportError;

    fn make_service(domains: &[(&str, &FakeDomain)]) -> (LookupService, Arc<DiscoveryCache>) {
        let finder = FakePoolFinder::new();
        for (name, domain) in domains {
            finder.add(name, domain);
        }
        let store = PoolEntryStore::new(finder, "eis");
        let cache = DiscoveryCache::new();
        let tx_less = TransactionLess::new(Arc::new(NoTransactionManager));
        (LookupService::new(store, cache.clone(), Lookup, tx_less), cache)
    }

    fn names(pools: &[Arc<PoolEntry>]) -> Vec<String> {
        pools.iter().map(|p| p.name().to_string()).collect()
    }

    #[test]
    fn test_find_service_skips_failing_pool() {
        let a = FakeDomain::new("a");
        let b = FakeDomain::new("b");
        a.fail_lookups(Some(TransportError::unreachable("down")));
        b.serve("echo", 1);
        let pools = vec![
            PoolEntry::new("eis/a", a.factory()),
            PoolEntry::new("eis/b", b.factory()),
        ];
        let tx_less = TransactionLess::new(Arc::new(NoTransactionManager));
        let found = Lookup.find_service("echo", &pools, &tx_less);
        assert!(!found.is_resolved(pools[0].name()));
        assert!(found.is_resolved(pools[1].name()));
        assert_eq!(names(&found.randomize_with_priority()), vec!["eis/b"]);
    }

    #[test]
    fn test_find_service_marks_empty_answers_resolved() {
        let a = FakeDomain::new("a");
        let pools = vec![PoolEntry::new("eis/a", a.factory())];
        let tx_less = TransactionLess::new(Arc::new(NoTransactionManager));
        let found = Lookup.find_service("echo", &pools, &tx_less);
        assert!(found.is_empty());
        assert!(found.contains_resolved());
        assert_eq!(a.open_connections(), 0);
    }

    #[test]
    fn test_find_queue() {
        let a = FakeDomain::new("a");
        let b = FakeDomain::new("b");
        b.add_queue("q");
        let pools = vec![
            PoolEntry::new("eis/a", a.factory()),
            PoolEntry::new("eis/b", b.factory()),
        ];
        let tx_less = TransactionLess::new(Arc::new(NoTransactionManager));
        let found = Lookup.find_queue(&QueueInfo::new("q"), &pools, &tx_less);
        assert_eq!(names(&found), vec!["eis/b"]);
    }

    #[test]
    fn test_get_service_uses_cache_once_all_checked() {
        let a = FakeDomain::new("a");
        let b = FakeDomain::new("b");
        a.serve("echo", 0);
        let (service, _cache) = make_service(&[("eis/a", &a), ("eis/b", &b)]);
        assert_eq!(names(&service.get_service("echo")), vec!["eis/a"]);
        let lookups = a.lookup_count() + b.lookup_count();
        assert_eq!(names(&service.get_service("echo")), vec!["eis/a"]);
        assert_eq!(a.lookup_count() + b.lookup_count(), lookups);
    }

    #[test]
    fn test_get_service_only_asks_unresolved_pools() {
        let a = FakeDomain::new("a");
        let b = FakeDomain::new("b");
        a.serve("echo", 0);
        b.serve("echo", 1);
        b.fail_lookups(Some(TransportError::unreachable("down")));
        let (service, _cache) = make_service(&[("eis/a", &a), ("eis/b", &b)]);
        assert_eq!(names(&service.get_service("echo")), vec!["eis/a"]);
        let a_lookups = a.lookup_count();

        b.fail_lookups(None);
        assert_eq!(names(&service.get_service("echo")), vec!["eis/a", "eis/b"]);
        assert_eq!(a.lookup_count(), a_lookups);
    }

    #[test]
    fn test_get_service_unknown_is_empty() {
        let a = FakeDomain::new("a");
        let (service, cache) = make_service(&[("eis/a", &a)]);
        assert!(service.get_service("nope").is_empty());
        assert!(cache.get("nope").contains_resolved());
    }

    #[test]
    fn test_get_queue_caches() {
        let a = FakeDomain::new("a");
        a.add_queue("q");
        let (service, cache) = make_service(&[("eis/a", &a)]);
        let pool = service.get_queue(&QueueInfo::new("q")).unwrap();
        assert_eq!(pool.name().as_str(), "eis/a");
        let lookups = a.lookup_count();
        assert!(service.get_queue(&QueueInfo::new("q")).is_some());
        assert_eq!(a.lookup_count(), lookups);
        assert_eq!(cache.queue_count(), 1);
        assert!(service.get_queue(&QueueInfo::new("missing")).is_none());
    }
}
