//! Deferred rediscovery for pools whose topology-change task could not be
//! scheduled.

use std::sync::Arc;

use crate::pool_store::PoolEntryStore;
use crate::repopulate::CacheRepopulator;

pub struct FailedDiscoveryHandler {
    store: Arc<PoolEntryStore>,
    repopulator: Arc<CacheRepopulator>,
}

impl FailedDiscoveryHandler {
    pub fn new(store: Arc<PoolEntryStore>, repopulator: Arc<CacheRepopulator>) -> Self {
        Self { store, repopulator }
    }

    /// Repopulate every flagged pool, clearing its flag first. Runs on the
    /// calling thread before the call is routed. Returns the number of pools
    /// rediscovered.
    pub fn issue_domain_discovery_and_repopulate(&self) -> usize {
        let mut rediscovered = 0;
        for pool in self.store.get() {
            if !pool.take_needs_domain_discovery() {
                continue;
            }
            tracing::info!(pool = %pool.name(), "running deferred domain discovery");
            self.repopulator.repopulate(&pool);
            rediscovered += 1;
        }
        rediscovered
    }
}
