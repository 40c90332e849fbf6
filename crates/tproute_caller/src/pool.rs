//! Pool entry: one configured route to a backend domain.
//!
//! State machine over two flags, `valid` and `enabled`:
//!
//! - `valid` follows connectivity: set by `validate()`, cleared by a failed
//!   validation or by a connection-level failure during a call.
//! - `enabled` follows the domain: cleared when the domain announces it is
//!   disconnecting, set again when that connection closes.
//!
//! Usable ⇔ `valid ∧ enabled`. There is no terminal state.
//!
//! Identity is the immutable pool name only; the flags never take part in
//! equality or hashing, so a pool never gets lost inside a hash container
//! when its health flips.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tproute_common::types::PoolName;

use crate::transport::{Connection, ConnectionFactory, ConnectionListener, TransportResult};

pub struct PoolEntry {
    name: PoolName,
    factory: Arc<dyn ConnectionFactory>,
    valid: AtomicBool,
    enabled: AtomicBool,
    listener_added: AtomicBool,
    needs_domain_discovery: AtomicBool,
}

impl PoolEntry {
    /// Create an entry and validate it once.
    pub fn new(name: impl Into<PoolName>, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let entry = Self::unvalidated(name, factory);
        entry.validate();
        entry
    }

    /// Create an entry that starts out valid without touching the backend.
    pub fn unvalidated(name: impl Into<PoolName>, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            factory,
            valid: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            listener_added: AtomicBool::new(false),
            needs_domain_discovery: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &PoolName {
        &self.name
    }

    /// Check out a connection. Released when the returned box is dropped.
    pub fn connection(&self) -> TransportResult<Box<dyn Connection>> {
        self.factory.connection()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && self.enabled.load(Ordering::Acquire)
    }

    pub fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        tracing::debug!(pool = %self.name, "pool invalidated");
    }

    /// Probe connectivity by checking out (and immediately releasing) a
    /// connection.
    pub fn validate(self: &Arc<Self>) {
        match self.connection() {
            Ok(mut con) => {
                self.maybe_add_listener(con.as_mut());
                self.valid.store(true, Ordering::Release);
                tracing::debug!(pool = %self.name, "pool validated");
            }
            Err(e) => {
                self.valid.store(false, Ordering::Release);
                tracing::warn!(pool = %self.name, error = %e, "pool validation failed");
            }
        }
    }

    pub fn needs_domain_discovery(&self) -> bool {
        self.needs_domain_discovery.load(Ordering::Acquire)
    }

    pub fn set_needs_domain_discovery(&self, needs: bool) {
        self.needs_domain_discovery.store(needs, Ordering::Release);
    }

    /// Clear the rediscovery flag, returning whether it was set.
    pub fn take_needs_domain_discovery(&self) -> bool {
        self.needs_domain_discovery.swap(false, Ordering::AcqRel)
    }

    fn maybe_add_listener(self: &Arc<Self>, con: &mut dyn Connection) {
        if self
            .listener_added
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            con.add_connection_listener(self.clone());
        }
    }
}

impl ConnectionListener for PoolEntry {
    fn connection_enabled(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::info!(pool = %self.name, "pool enabled");
    }

    fn connection_disabled(&self) {
        self.enabled.store(false, Ordering::Release);
        tracing::info!(pool = %self.name, "pool disabled, domain is disconnecting");
    }
}

impl PartialEq for PoolEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PoolEntry {}

impl Hash for PoolEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("name", &self.name)
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field(
                "needs_domain_discovery",
                &self.needs_domain_discovery.load(Ordering::Relaxed),
            )
            .finish()
    }
}
