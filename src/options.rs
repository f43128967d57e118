//! In-process runtime tunables for the watcher.
//!
//! These are constructor knobs, not a parsed configuration file: rule and
//! file configuration are supplied by an external collaborator and are out
//! of scope for this crate.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Options {
    /// How long the ring-buffer reader sleeps when consumer and producer
    /// positions are equal (§4.7 step 2).
    pub poll_interval: Duration,
    /// Back-off between polls of a BUSY record (§4.7 step 5).
    pub busy_backoff: Duration,
    /// Capacity of the bounded alert channel (§6 "bounded capacity (e.g. 64)").
    pub channel_capacity: usize,
    /// Ring-buffer `max_entries` used when no `execve_events` map spec is
    /// present in the ELF image (§4.3).
    pub default_ring_buffer_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(250),
            busy_backoff: Duration::from_micros(1),
            channel_capacity: 64,
            default_ring_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn with_busy_backoff(mut self, d: Duration) -> Self {
        self.busy_backoff = d;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_default_ring_buffer_size(mut self, size: u32) -> Self {
        self.default_ring_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = Options::default();
        assert_eq!(opts.poll_interval, Duration::from_micros(250));
        assert_eq!(opts.busy_backoff, Duration::from_micros(1));
        assert_eq!(opts.channel_capacity, 64);
        assert_eq!(opts.default_ring_buffer_size, 16 * 1024 * 1024);
    }

    #[test]
    fn builder_overrides_fields() {
        let opts = Options::new()
            .with_channel_capacity(8)
            .with_default_ring_buffer_size(4096);
        assert_eq!(opts.channel_capacity, 8);
        assert_eq!(opts.default_ring_buffer_size, 4096);
    }
}
