//! Lock-free pipeline metrics and periodic reporting
//!
//! Counters are plain atomics updated on the hot path. `report()` swaps the
//! per-interval values (latency histogram, sum, max) and reads the monotonic
//! totals.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical counters and
//! must not be used for coordination.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Delivery latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
pub const METRICS_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return METRICS_BUCKET_BOUNDS.get(i).copied().unwrap_or(METRICS_BUCKET_BOUNDS[9] * 2);
        }
    }
    METRICS_BUCKET_BOUNDS[9] * 2
}

#[derive(Default)]
pub struct Metrics {
    frames_received: AtomicU64,
    frames_malformed: AtomicU64,
    frames_ignored: AtomicU64,
    events_forwarded: AtomicU64,
    events_dropped: AtomicU64,
    transform_failed: AtomicU64,
    validation_failed: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
    delivery_retries: AtomicU64,
    reconnects: AtomicU64,
    // Cumulative, for scrapes
    latency_total_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    latency_total_sum_ms: AtomicU64,
    // Per-interval, reset on report
    delivery_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    delivery_latency_sum_ms: AtomicU64,
    delivery_latency_max_ms: AtomicU64,
    deliveries_since_report: AtomicU64,
    last_report: parking_lot::Mutex<Option<Instant>>,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_frame_received, frames_received, frames_received);
    counter!(record_frame_malformed, frames_malformed, frames_malformed);
    counter!(record_frame_ignored, frames_ignored, frames_ignored);
    counter!(record_event_forwarded, events_forwarded, events_forwarded);
    counter!(record_event_dropped, events_dropped, events_dropped);
    counter!(record_transform_failed, transform_failed, transform_failed);
    counter!(record_validation_failed, validation_failed, validation_failed);
    counter!(record_delivery_failed, delivery_failed, delivery_failed);
    counter!(record_reconnect, reconnects, reconnects);

    #[inline]
    pub fn record_delivered(&self, latency_ms: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.deliveries_since_report.fetch_add(1, Ordering::Relaxed);
        self.delivery_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.delivery_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.latency_total_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.latency_total_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.delivery_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_delivery_retries(&self, retries: u32) {
        self.delivery_retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    #[inline]
    pub fn delivery_retries(&self) -> u64 {
        self.delivery_retries.load(Ordering::Relaxed)
    }

    /// Cumulative delivery latency histogram and sum (never reset)
    pub fn latency_totals(&self) -> ([u64; METRICS_NUM_BUCKETS], u64) {
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        for (slot, bucket) in buckets.iter_mut().zip(&self.latency_total_buckets) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        (buckets, self.latency_total_sum_ms.load(Ordering::Relaxed))
    }

    /// Snapshot totals and reset the per-interval latency data
    pub fn report(&self) -> MetricsSummary {
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        for (slot, bucket) in buckets.iter_mut().zip(&self.delivery_latency_buckets) {
            *slot = bucket.swap(0, Ordering::Relaxed);
        }
        let interval_deliveries = self.deliveries_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.delivery_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.delivery_latency_max_ms.swap(0, Ordering::Relaxed);

        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report.lock();
            let elapsed = last.map(|t| now.duration_since(t).as_secs_f64());
            *last = Some(now);
            elapsed
        };
        let deliveries_per_sec = match elapsed_secs {
            Some(secs) if secs > 0.0 => interval_deliveries as f64 / secs,
            _ => 0.0,
        };

        MetricsSummary {
            frames_received: self.frames_received(),
            frames_malformed: self.frames_malformed(),
            frames_ignored: self.frames_ignored(),
            events_forwarded: self.events_forwarded(),
            events_dropped: self.events_dropped(),
            transform_failed: self.transform_failed(),
            validation_failed: self.validation_failed(),
            delivered: self.delivered(),
            delivery_failed: self.delivery_failed(),
            delivery_retries: self.delivery_retries(),
            reconnects: self.reconnects(),
            deliveries_per_sec,
            latency_buckets: buckets,
            avg_latency_ms: if interval_deliveries > 0 { latency_sum / interval_deliveries } else { 0 },
            max_latency_ms: latency_max,
            p50_latency_ms: percentile_from_buckets(&buckets, 0.50),
            p99_latency_ms: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_ignored: u64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub transform_failed: u64,
    pub validation_failed: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub delivery_retries: u64,
    pub reconnects: u64,
    pub deliveries_per_sec: f64,
    pub latency_buckets: [u64; METRICS_NUM_BUCKETS],
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p99_latency_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames = %self.frames_received,
            malformed = %self.frames_malformed,
            forwarded = %self.events_forwarded,
            dropped = %self.events_dropped,
            transform_failed = %self.transform_failed,
            validation_failed = %self.validation_failed,
            delivered = %self.delivered,
            delivery_failed = %self.delivery_failed,
            retries = %self.delivery_retries,
            reconnects = %self.reconnects,
            deliveries_per_sec = format!("{:.1}", self.deliveries_per_sec),
            avg_latency_ms = %self.avg_latency_ms,
            p99_latency_ms = %self.p99_latency_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(100_000), 10);
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.record_frame_received();
        metrics.record_frame_received();
        metrics.record_frame_malformed();
        metrics.record_delivery_retries(3);

        assert_eq!(metrics.frames_received(), 2);
        assert_eq!(metrics.frames_malformed(), 1);
        assert_eq!(metrics.delivery_retries(), 3);
    }

    #[test]
    fn test_report_resets_interval_latency() {
        let metrics = Metrics::new();
        metrics.record_delivered(5);
        metrics.record_delivered(15);
        metrics.record_delivered(6000);

        let summary = metrics.report();
        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.max_latency_ms, 6000);
        assert_eq!(summary.avg_latency_ms, (5 + 15 + 6000) / 3);
        assert_eq!(summary.latency_buckets[0], 1);
        assert_eq!(summary.latency_buckets[1], 1);
        assert_eq!(summary.latency_buckets[10], 1);
        assert_eq!(summary.p50_latency_ms, 20);

        let second = metrics.report();
        assert_eq!(second.delivered, 3, "totals are monotonic");
        assert_eq!(second.max_latency_ms, 0);
        assert_eq!(second.latency_buckets.iter().sum::<u64>(), 0);

        let (totals, sum) = metrics.latency_totals();
        assert_eq!(totals.iter().sum::<u64>(), 3);
        assert_eq!(sum, 6020);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; METRICS_NUM_BUCKETS], 0.99), 0);
    }
}
