//! Operator-facing counters (§4.13). All fields are atomic since the
//! hot path updates them without taking any lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    events_written_total: AtomicU64,
    events_dropped_total: AtomicU64,
    buffers_allocated_total: AtomicU64,
    buffers_stolen_total: AtomicU64,
    sequence_gaps_detected_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_events_written(&self) {
        self.events_written_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffers_allocated(&self) {
        self.buffers_allocated_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffers_stolen(&self) {
        self.buffers_stolen_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sequence_gaps(&self, n: u64) {
        self.sequence_gaps_detected_total
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn events_written(&self) -> u64 {
        self.events_written_total.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    pub fn buffers_allocated(&self) -> u64 {
        self.buffers_allocated_total.load(Ordering::Relaxed)
    }

    pub fn buffers_stolen(&self) -> u64 {
        self.buffers_stolen_total.load(Ordering::Relaxed)
    }

    pub fn sequence_gaps_detected(&self) -> u64 {
        self.sequence_gaps_detected_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let m = Metrics::new();
        assert_eq!(m.events_written(), 0);
        m.inc_events_written();
        m.inc_events_written();
        m.inc_events_dropped();
        assert_eq!(m.events_written(), 2);
        assert_eq!(m.events_dropped(), 1);
    }
}
