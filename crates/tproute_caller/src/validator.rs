//! Periodic pool validation.
//!
//! Every pass probes each pool with a fresh connection. A pool that comes
//! back from invalid gets its cache entries rebuilt and the topology observer
//! registered again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tproute_common::crash_domain::catch_task;
use tproute_common::shutdown::StopSignal;

use crate::pool::PoolEntry;
use crate::pool_store::PoolEntryStore;
use crate::repopulate::CacheRepopulator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub checked: usize,
    pub reconnected: usize,
    /// Pools whose validation panicked; they are left invalid.
    pub failed: usize,
}

pub struct ConnectionValidator {
    store: Arc<PoolEntryStore>,
    repopulator: Arc<CacheRepopulator>,
}

impl ConnectionValidator {
    pub fn new(store: Arc<PoolEntryStore>, repopulator: Arc<CacheRepopulator>) -> Self {
        Self { store, repopulator }
    }

    /// Validate one pool. Returns true if it went from unusable to usable.
    pub fn validate(&self, pool: &Arc<PoolEntry>) -> bool {
        let was_invalid = pool.is_invalid();
        pool.validate();
        if was_invalid && pool.is_valid() {
            tracing::info!(pool = %pool.name(), "pool reconnected, repopulating cache");
            self.repopulator.repopulate(pool);
            self.store.add_connection_observer(pool);
            return true;
        }
        false
    }

    /// Validate every pool in the store. A panic while validating one pool
    /// marks that pool invalid and moves on.
    pub fn validate_all(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        for pool in self.store.get() {
            report.checked += 1;
            let ctx = format!("pool={}", pool.name());
            match catch_task("validate_pool", &ctx, || self.validate(&pool)) {
                Ok(true) => report.reconnected += 1,
                Ok(false) => {}
                Err(_) => {
                    pool.invalidate();
                    report.failed += 1;
                }
            }
        }
        tracing::debug!(
            checked = report.checked,
            reconnected = report.reconnected,
            failed = report.failed,
            "validation pass complete"
        );
        report
    }
}

// ── Timer ───────────────────────────────────────────────────────────────────

/// One validation pass at a time; an overlapping trigger is skipped.
pub struct ValidationWork {
    validator: Arc<ConnectionValidator>,
    in_progress: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ValidationWork {
    pub fn new(validator: Arc<ConnectionValidator>) -> Self {
        Self {
            validator,
            in_progress: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Run a pass unless one is already running. Returns the report of the
    /// pass, or `None` when it was skipped.
    pub fn work(&self) -> Option<ValidationReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("validation already in progress, skipping");
            return None;
        }
        let report = {
            let _running = InProgress(&self.in_progress);
            self.validator.validate_all()
        };
        self.runs.fetch_add(1, Ordering::Relaxed);
        Some(report)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Background thread running [`ValidationWork`] at a fixed interval, first
/// pass immediately.
pub struct ValidationTimer {
    signal: StopSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ValidationTimer {
    /// Returns `Err` if the thread cannot be spawned.
    pub fn start(work: Arc<ValidationWork>, interval: Duration) -> Result<Self, std::io::Error> {
        let signal = StopSignal::new();
        let signal_clone = signal.clone();

        let handle = std::thread::Builder::new()
            .name("tproute-validator".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "validation timer started");
                signal_clone.run_every(interval, || {
                    let _ = catch_task("validation_timer", "", || work.work());
                });
                tracing::info!("validation timer stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = "validation-timer",
                    error = %e,
                    "failed to spawn validation thread"
                );
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop the timer and wait for an in-flight pass to finish.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ValidationTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiscoveryCache;
    use crate::testing::{FakeDomain, FakePoolFinder};
    use crate::txn::{NoTransactionManager, TransactionLess};

    struct Fixture {
        validator: Arc<ConnectionValidator>,
        store: Arc<PoolEntryStore>,
        cache: Arc<DiscoveryCache>,
        a: FakeDomain,
    }

    fn make_fixture() -> Fixture {
        let finder = FakePoolFinder::new();
        let a = FakeDomain::new("a");
        finder.add("eis/a", &a);
        let store = PoolEntryStore::new(finder, "eis");
        let cache = DiscoveryCache::new();
        let repopulator =
            CacheRepopulator::new(cache.clone(), TransactionLess::new(Arc::new(NoTransactionManager)));
        let validator = Arc::new(ConnectionValidator::new(store.clone(), repopulator));
        Fixture {
            validator,
            store,
            cache,
            a,
        }
    }

    #[test]
    fn test_valid_pool_is_not_repopulated() {
        let f = make_fixture();
        let pool = f.store.get().remove(0);
        assert!(!f.validator.validate(&pool));
        assert_eq!(f.a.discovery_count(), 0);
    }

    #[test]
    fn test_reconnect_triggers_repopulation() {
        let f = make_fixture();
        f.a.serve("echo", 1);
        let pool = f.store.get().remove(0);
        f.cache.store("echo", &crate::cache::PoolsByPriority::of(vec![(0, vec![pool.clone()])], vec![]));

        f.a.set_reachable(false);
        assert!(!f.validator.validate(&pool));
        assert!(pool.is_invalid());

        f.a.set_reachable(true);
        assert!(f.validator.validate(&pool));
        assert!(pool.is_valid());
        assert_eq!(f.a.discovery_count(), 1);
        assert_eq!(f.cache.get("echo").priorities(), vec![1]);
    }

    #[test]
    fn test_validate_all_reports() {
        let f = make_fixture();
        let pool = f.store.get().remove(0);
        pool.invalidate();
        let report = f.validator.validate_all();
        assert_eq!(
            report,
            ValidationReport {
                checked: 1,
                reconnected: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn test_work_is_single_flight() {
        let f = make_fixture();
        let work = ValidationWork::new(f.validator.clone());
        work.in_progress.store(true, Ordering::Release);
        assert!(work.work().is_none());
        assert_eq!(work.skipped(), 1);

        work.in_progress.store(false, Ordering::Release);
        assert!(work.work().is_some());
        assert!(!work.is_in_progress());
        assert_eq!(work.runs(), 1);
    }

    #[test]
    fn test_timer_runs_and_stops() {
        let f = make_fixture();
        let work = Arc::new(ValidationWork::new(f.validator.clone()));
        let mut timer = ValidationTimer::start(work.clone(), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while work.runs() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(work.runs() >= 2);
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.is_running());
    }
}
