//! Ambient atomic-counter primitive (spec.md §5, "every counter exposed via
//! `get_info` is an atomic integer with relaxed semantics (exact-reset-on-
//! snapshot via `exchange(0)`)").
//!
//! Grounded on the teacher's `metrics.rs` atomic-field pattern, generalised
//! into one reusable type instead of one-off fields per metric, since this
//! crate's counters are exposed identically across several components.

use std::sync::atomic::{AtomicU64, Ordering};

/// A single relaxed, reset-on-read counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value without resetting it.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Current value, resetting it to 0 (property 9, spec.md §8: two
    /// consecutive snapshots with no intervening activity yield 0 on the
    /// second).
    pub fn snapshot(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Per-link request-handler counters (spec.md §4.5.1 `get_info`).
#[derive(Debug, Default)]
pub struct RequestHandlerCounters {
    pub requests_found: Counter,
    pub requests_not_found: Counter,
    pub requests_not_yet: Counter,
    pub requests_timed_out: Counter,
    pub requests_bad: Counter,
    pub pop_reqs: Counter,
    pub pops_count: Counter,
    pub num_buffer_cleanups: Counter,
    pub payloads_recorded: Counter,
}

/// Snapshot of [`RequestHandlerCounters`] suitable for `serde_json`
/// serialisation by `get_info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestHandlerCountersSnapshot {
    pub requests_found: u64,
    pub requests_not_found: u64,
    pub requests_not_yet: u64,
    pub requests_timed_out: u64,
    pub requests_bad: u64,
    pub pop_reqs: u64,
    pub pops_count: u64,
    pub num_buffer_cleanups: u64,
    pub payloads_recorded: u64,
}

impl RequestHandlerCounters {
    pub fn snapshot(&self) -> RequestHandlerCountersSnapshot {
        RequestHandlerCountersSnapshot {
            requests_found: self.requests_found.snapshot(),
            requests_not_found: self.requests_not_found.snapshot(),
            requests_not_yet: self.requests_not_yet.snapshot(),
            requests_timed_out: self.requests_timed_out.snapshot(),
            requests_bad: self.requests_bad.snapshot(),
            pop_reqs: self.pop_reqs.snapshot(),
            pops_count: self.pops_count.snapshot(),
            num_buffer_cleanups: self.num_buffer_cleanups.snapshot(),
            payloads_recorded: self.payloads_recorded.snapshot(),
        }
    }
}

/// Per-link orchestrator counters (spec.md §4.6).
#[derive(Debug, Default)]
pub struct OrchestratorCounters {
    pub payloads_overwritten: Counter,
    pub packets_processed: Counter,
    pub packets_arrived_too_late: Counter,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorCountersSnapshot {
    pub payloads_overwritten: u64,
    pub packets_processed: u64,
    pub packets_arrived_too_late: u64,
}

impl OrchestratorCounters {
    pub fn snapshot(&self) -> OrchestratorCountersSnapshot {
        OrchestratorCountersSnapshot {
            payloads_overwritten: self.payloads_overwritten.snapshot(),
            packets_processed: self.packets_processed.snapshot(),
            packets_arrived_too_late: self.packets_arrived_too_late.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_to_zero() {
        let c = Counter::new();
        c.inc();
        c.inc();
        assert_eq!(c.snapshot(), 2);
        assert_eq!(c.snapshot(), 0);
    }
}
