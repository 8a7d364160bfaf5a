use std::sync::atomic::{AtomicU64, Ordering};

/// Per-key pool counters. Plain atomics rather than a lock, mirroring the
/// way counters elsewhere in this codebase are tracked independently of the
/// lock protecting the bucket's queue — a `Rent` racing a metrics read
/// should never block on it.
#[derive(Default)]
pub struct PoolMetrics {
    resident: AtomicU64,
    active: AtomicU64,
    created_total: AtomicU64,
    creation_failures_total: AtomicU64,
    discarded_total: AtomicU64,
    disposed_total: AtomicU64,
    rebalance_failures_total: AtomicU64,
}

impl PoolMetrics {
    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    pub fn creation_failures_total(&self) -> u64 {
        self.creation_failures_total.load(Ordering::Relaxed)
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded_total.load(Ordering::Relaxed)
    }

    pub fn disposed_total(&self) -> u64 {
        self.disposed_total.load(Ordering::Relaxed)
    }

    pub fn rebalance_failures_total(&self) -> u64 {
        self.rebalance_failures_total.load(Ordering::Relaxed)
    }

    pub(super) fn record_rent_from_bucket(&self) {
        self.resident.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_created(&self) {
        self.created_total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_creation_failure(&self) {
        self.creation_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_returned_to_bucket(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.resident.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_discarded_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.discarded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_discarded_resident(&self, count: u64) {
        self.resident.fetch_sub(count, Ordering::Relaxed);
        self.discarded_total.fetch_add(count, Ordering::Relaxed);
    }

    pub(super) fn record_rebalance_failure(&self) {
        self.rebalance_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Explicit shutdown, as opposed to a trim/overflow `discarded` event:
    /// every resident client in the bucket is destroyed. Clients still
    /// rented out at the moment of disposal stay counted as `active` (the
    /// renter destroys them on return instead, since the pool doesn't hold
    /// a handle to them) — that's what keeps
    /// `disposed_total + active == created_total` true at any point.
    pub(super) fn record_disposed(&self, resident_count: u64) {
        self.resident.fetch_sub(resident_count, Ordering::Relaxed);
        self.disposed_total.fetch_add(resident_count, Ordering::Relaxed);
    }
}

/// Snapshot merged into `Diagnostics()`: `{resident, active, max}` per key,
/// summed across all keys for the pool-wide view.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolDiagnostics {
    pub resident: u64,
    pub active: u64,
    pub max: u64,
}

impl std::ops::Add for PoolDiagnostics {
    type Output = PoolDiagnostics;

    fn add(self, rhs: Self) -> Self::Output {
        PoolDiagnostics {
            resident: self.resident + rhs.resident,
            active: self.active + rhs.active,
            max: self.max + rhs.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_from_bucket_moves_resident_to_active() {
        let metrics = PoolMetrics::default();
        metrics.record_created();
        metrics.record_returned_to_bucket();
        assert_eq!(metrics.resident(), 1);
        assert_eq!(metrics.active(), 0);

        metrics.record_rent_from_bucket();
        assert_eq!(metrics.resident(), 0);
        assert_eq!(metrics.active(), 1);
    }

    #[test]
    fn diagnostics_sum() {
        let a = PoolDiagnostics { resident: 1, active: 2, max: 10 };
        let b = PoolDiagnostics { resident: 3, active: 0, max: 10 };
        let sum = a + b;
        assert_eq!(sum.resident, 4);
        assert_eq!(sum.active, 2);
        assert_eq!(sum.max, 20);
    }
}
