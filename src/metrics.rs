use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque counters the core increments. The metrics export surface itself
/// is an external collaborator's concern; this struct only carries the
/// numbers.
pub struct Metrics {
    pub events_total: AtomicU64,
    pub dropped_events_total: AtomicU64,
    pub alerts_emitted_total: AtomicU64,
    pub ring_buffer_errors_total: AtomicU64,
    pub channel_full_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            dropped_events_total: AtomicU64::new(0),
            alerts_emitted_total: AtomicU64::new(0),
            ring_buffer_errors_total: AtomicU64::new(0),
            channel_full_total: AtomicU64::new(0),
        }
    }

    pub fn inc_events(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_alerts_emitted(&self) {
        self.alerts_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ring_buffer_errors(&self) {
        self.ring_buffer_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channel_full(&self) {
        self.channel_full_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn dropped_events_total(&self) -> u64 {
        self.dropped_events_total.load(Ordering::Relaxed)
    }

    pub fn alerts_emitted_total(&self) -> u64 {
        self.alerts_emitted_total.load(Ordering::Relaxed)
    }

    pub fn ring_buffer_errors_total(&self) -> u64 {
        self.ring_buffer_errors_total.load(Ordering::Relaxed)
    }

    pub fn channel_full_total(&self) -> u64 {
        self.channel_full_total.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.events_total(), 0);
        m.inc_events();
        m.inc_events();
        m.inc_dropped();
        m.inc_alerts_emitted();
        m.inc_ring_buffer_errors();
        m.inc_channel_full();
        assert_eq!(m.events_total(), 2);
        assert_eq!(m.dropped_events_total(), 1);
        assert_eq!(m.alerts_emitted_total(), 1);
        assert_eq!(m.ring_buffer_errors_total(), 1);
        assert_eq!(m.channel_full_total(), 1);
    }
}
