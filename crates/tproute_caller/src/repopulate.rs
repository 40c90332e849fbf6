//! Cache repopulation after a pool reconnects or its domain's topology
//! changes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::DiscoveryCache;
use crate::pool::PoolEntry;
use crate::txn::TransactionLess;

/// Rebuilds the cache entries of one pool at a time.
///
/// Every repopulation, for any pool, runs under one lock so no rebuild ever
/// starts from a cache another rebuild has half purged.
pub struct CacheRepopulator {
    cache: Arc<DiscoveryCache>,
    tx_less: TransactionLess,
    lock: Mutex<()>,
}

impl CacheRepopulator {
    pub fn new(cache: Arc<DiscoveryCache>, tx_less: TransactionLess) -> Arc<Self> {
        Arc::new(Self {
            cache,
            tx_less,
            lock: Mutex::new(()),
        })
    }

    /// Purge `pool` from the cache and re-add it for every known service and
    /// queue it still serves. Returns false when discovery failed; the pool
    /// then stays purged (and invalid) until it validates again.
    pub fn repopulate(&self, pool: &Arc<PoolEntry>) -> bool {
        let _guard = self.lock.lock();
        let names = self.cache.snapshot_names();
        self.cache.purge(pool);
        match self.tx_less.discover(pool, &names) {
            Some(discovery) => {
                self.cache.repopulate(&discovery, pool);
                true
            }
            None => false,
        }
    }
}
