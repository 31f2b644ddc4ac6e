//! Federation engine: peer state, referrals, and sync.

pub mod referrals;
pub mod refresh;
pub mod sync;

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for anomalies observed during sync ingest. Logged when they
/// move; surfaced nowhere else.
#[derive(Debug, Default)]
pub struct FederationMetrics {
    conflicts_detected: AtomicU64,
    sovereignty_violations: AtomicU64,
}

impl FederationMetrics {
    pub fn record_conflict(&self) -> u64 {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_sovereignty_violation(&self) -> u64 {
        self.sovereignty_violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn conflicts_detected(&self) -> u64 {
        self.conflicts_detected.load(Ordering::Relaxed)
    }

    pub fn sovereignty_violations(&self) -> u64 {
        self.sovereignty_violations.load(Ordering::Relaxed)
    }
}
