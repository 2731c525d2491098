//! Atomic connection counters.
//!
//! All atomics use `Relaxed` ordering; these are monotonic display counters
//! with no synchronization requirements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StatsInner {
    accepted: AtomicU64,
    correlated: AtomicU64,
    correlation_failures: AtomicU64,
    dial_failures: AtomicU64,
    direct_fallbacks: AtomicU64,
    relays_completed: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Thread-safe connection statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct ProxyStats {
    inner: Arc<StatsInner>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub correlated: u64,
    pub correlation_failures: u64,
    pub dial_failures: u64,
    pub direct_fallbacks: u64,
    pub relays_completed: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_accepted(&self) {
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_correlated(&self) {
        self.inner.correlated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_correlation_failures(&self) {
        self.inner.correlation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dial_failures(&self) {
        self.inner.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_fallbacks(&self) {
        self.inner.direct_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, bytes_up: u64, bytes_down: u64) {
        self.inner.relays_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.inner.bytes_down.fetch_add(bytes_down, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            correlated: self.inner.correlated.load(Ordering::Relaxed),
            correlation_failures: self.inner.correlation_failures.load(Ordering::Relaxed),
            dial_failures: self.inner.dial_failures.load(Ordering::Relaxed),
            direct_fallbacks: self.inner.direct_fallbacks.load(Ordering::Relaxed),
            relays_completed: self.inner.relays_completed.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
        }
    }
}
