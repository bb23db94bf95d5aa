//! Accounting Counters
//!
//! Lightweight counters for the aggregator and the event transport, shared
//! by `Arc` between producers, the consumer loop, and exporters.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - One counter per quantity; no per-CPU arrays (event rates are low)
//! - Zero-allocation on the event path

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters describing everything the aggregator has seen
#[derive(Debug, Default)]
pub struct AccountingMetrics {
    // Applied events
    pub creates: AtomicU64,
    pub deletes: AtomicU64,
    pub orphan_deletes: AtomicU64,
    pub apply_time_ns: AtomicU64,

    // Discarded events
    pub malformed: AtomicU64,
    pub refused: AtomicU64,
    pub dropped_at_source: AtomicU64,

    // Byte flow
    pub bytes_created: AtomicU64,
    pub bytes_released: AtomicU64,

    // Quota transitions
    pub quota_blocks: AtomicU64,
    pub quota_unblocks: AtomicU64,
}

impl AccountingMetrics {
    /// Create a new shared counter set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an applied CREATE
    pub fn record_create(&self, bytes: u64) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        self.bytes_created.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an applied DELETE and how much it released
    pub fn record_delete(&self, released: u64) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_released.fetch_add(released, Ordering::Relaxed);
    }

    /// Record a DELETE for a task with no entry
    pub fn record_orphan_delete(&self) {
        self.orphan_deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event discarded because a table was full
    pub fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded malformed event
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event the transport dropped because the buffer was full
    pub fn record_dropped(&self) {
        self.dropped_at_source.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a container entering the blocked state
    pub fn record_block(&self) {
        self.quota_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a container leaving the blocked state
    pub fn record_unblock(&self) {
        self.quota_unblocks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_apply_time(&self, duration: Duration) {
        self.apply_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let creates = self.creates.load(Ordering::Relaxed);
        let deletes = self.deletes.load(Ordering::Relaxed);
        let orphan_deletes = self.orphan_deletes.load(Ordering::Relaxed);
        let applied = creates + deletes + orphan_deletes;
        let avg_apply_us = if applied == 0 {
            0.0
        } else {
            self.apply_time_ns.load(Ordering::Relaxed) as f64 / applied as f64 / 1_000.0
        };

        MetricsSnapshot {
            creates,
            deletes,
            orphan_deletes,
            malformed: self.malformed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            dropped_at_source: self.dropped_at_source.load(Ordering::Relaxed),
            bytes_created: self.bytes_created.load(Ordering::Relaxed),
            bytes_released: self.bytes_released.load(Ordering::Relaxed),
            quota_blocks: self.quota_blocks.load(Ordering::Relaxed),
            quota_unblocks: self.quota_unblocks.load(Ordering::Relaxed),
            avg_apply_us,
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        for counter in [
            &self.creates,
            &self.deletes,
            &self.orphan_deletes,
            &self.apply_time_ns,
            &self.malformed,
            &self.refused,
            &self.dropped_at_source,
            &self.bytes_created,
            &self.bytes_released,
            &self.quota_blocks,
            &self.quota_unblocks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of [`AccountingMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub creates: u64,
    pub deletes: u64,
    pub orphan_deletes: u64,
    pub malformed: u64,
    pub refused: u64,
    pub dropped_at_source: u64,
    pub bytes_created: u64,
    pub bytes_released: u64,
    pub quota_blocks: u64,
    pub quota_unblocks: u64,
    pub avg_apply_us: f64,
}

impl MetricsSnapshot {
    /// Events that reached the aggregator, valid or not
    pub fn events_seen(&self) -> u64 {
        self.creates + self.deletes + self.orphan_deletes + self.malformed + self.refused
    }

    /// One-line summary for shutdown logging
    pub fn summary(&self) -> String {
        format!(
            "creates={} deletes={} orphan_deletes={} malformed={} refused={} dropped={} \
             created={}B released={}B blocks={} unblocks={}",
            self.creates,
            self.deletes,
            self.orphan_deletes,
            self.malformed,
            self.refused,
            self.dropped_at_source,
            self.bytes_created,
            self.bytes_released,
            self.quota_blocks,
            self.quota_unblocks,
        )
    }
}

/// Records how long one event took to apply when dropped
pub struct ApplyTimer<'a> {
    start: Instant,
    metrics: &'a AccountingMetrics,
}

impl<'a> ApplyTimer<'a> {
    pub fn new(metrics: &'a AccountingMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }
}

impl<'a> Drop for ApplyTimer<'a> {
    fn drop(&mut self) {
        self.metrics.record_apply_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = AccountingMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.creates, 0);
        assert_eq!(snapshot.events_seen(), 0);
        assert_eq!(snapshot.avg_apply_us, 0.0);
    }

    #[test]
    fn test_record_operations() {
        let metrics = AccountingMetrics::new();

        metrics.record_create(4096);
        metrics.record_create(8192);
        metrics.record_delete(12288);
        metrics.record_orphan_delete();
        metrics.record_malformed();
        metrics.record_refused();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.creates, 2);
        assert_eq!(snapshot.deletes, 1);
        assert_eq!(snapshot.bytes_created, 12288);
        assert_eq!(snapshot.bytes_released, 12288);
        assert_eq!(snapshot.refused, 1);
        assert_eq!(snapshot.events_seen(), 6);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = AccountingMetrics::new();
        metrics.record_create(1);
        metrics.record_dropped();
        metrics.record_block();

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.creates, 0);
        assert_eq!(snapshot.dropped_at_source, 0);
        assert_eq!(snapshot.quota_blocks, 0);
    }

    #[test]
    fn test_apply_timer_records() {
        let metrics = AccountingMetrics::new();
        {
            let _timer = ApplyTimer::new(&metrics);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(metrics.apply_time_ns.load(Ordering::Relaxed) >= 2_000_000);
    }

    #[test]
    fn test_summary_mentions_counts() {
        let metrics = AccountingMetrics::new();
        metrics.record_create(4096);
        let summary = metrics.snapshot().summary();
        assert!(summary.contains("creates=1"));
        assert!(summary.contains("created=4096B"));
    }
}
