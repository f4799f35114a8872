//! Process-wide counters for externally-observable failures (spec.md §7,
//! §9 "global singletons are explicit-init, explicit-teardown").
//!
//! Ingress and session errors never propagate to callers; the only trace
//! they leave is one of these counters (or the event streams already
//! kept by [`crate::address::Registry`] and [`crate::diagnostics::DiagnosticsTracker`]).
//! Grounded on the teacher's own preference for plain atomics over a
//! metrics-crate dependency, generalized across this crate's full
//! spec.md §7 error-kind taxonomy rather than the teacher's narrower
//! frame/claim counters.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub frame_malformed: AtomicU64,
    pub unknown_pgn: AtomicU64,
    pub spn_extraction_failure: AtomicU64,
    pub session_reorder: AtomicU64,
    pub session_timeout: AtomicU64,
    pub session_abort: AtomicU64,
    pub address_conflict: AtomicU64,
    pub queue_overflow: AtomicU64,
    pub sink_failure: AtomicU64,
    pub backpressure_throttle: AtomicU64,
    /// Control-byte values that matched none of RTS/CTS/EOM_ACK/BAM/ABORT.
    pub transport_control_ignored: AtomicU64,
    /// `TP.DT` data frames with no matching session (spec.md §4.2).
    pub transport_orphan_data: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            frame_malformed: load(&self.frame_malformed),
            unknown_pgn: load(&self.unknown_pgn),
            spn_extraction_failure: load(&self.spn_extraction_failure),
            session_reorder: load(&self.session_reorder),
            session_timeout: load(&self.session_timeout),
            session_abort: load(&self.session_abort),
            address_conflict: load(&self.address_conflict),
            queue_overflow: load(&self.queue_overflow),
            sink_failure: load(&self.sink_failure),
            backpressure_throttle: load(&self.backpressure_throttle),
            transport_control_ignored: load(&self.transport_control_ignored),
            transport_orphan_data: load(&self.transport_orphan_data),
        }
    }
}

/// Plain-value snapshot of [`Metrics`] for status reporting, since the
/// atomics themselves aren't `Clone`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frame_malformed: u64,
    pub unknown_pgn: u64,
    pub spn_extraction_failure: u64,
    pub session_reorder: u64,
    pub session_timeout: u64,
    pub session_abort: u64,
    pub address_conflict: u64,
    pub queue_overflow: u64,
    pub sink_failure: u64,
    pub backpressure_throttle: u64,
    pub transport_control_ignored: u64,
    pub transport_orphan_data: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().unknown_pgn, 0);
        Metrics::incr(&metrics.unknown_pgn);
        Metrics::incr(&metrics.unknown_pgn);
        assert_eq!(metrics.snapshot().unknown_pgn, 2);
    }
}
