//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total samples evaluated (monotonic)
    samples_total: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Samples rejected by the accuracy gate (monotonic)
    samples_rejected: AtomicU64,
    /// Sum of evaluation latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max evaluation latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Evaluation latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    entries_total: AtomicU64,
    exits_confirmed_total: AtomicU64,
    exits_cancelled_total: AtomicU64,
    dwell_alerts_total: AtomicU64,
    emergency_alerts_total: AtomicU64,
    notifications_sent: AtomicU64,
    /// Notifications withheld because the cooldown window was open
    notifications_cooldown: AtomicU64,
    /// Entry notifications withheld for a higher-priority geofence
    notifications_priority: AtomicU64,
    notifications_failed: AtomicU64,
    /// Per-geofence errors captured into results
    geofence_errors: AtomicU64,
    /// Ingest samples dropped due to channel full (monotonic)
    ingest_dropped: AtomicU64,
    /// Pending exits currently waiting for confirmation
    pending_exits: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            entries_total: AtomicU64::new(0),
            exits_confirmed_total: AtomicU64::new(0),
            exits_cancelled_total: AtomicU64::new(0),
            dwell_alerts_total: AtomicU64::new(0),
            emergency_alerts_total: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_cooldown: AtomicU64::new(0),
            notifications_priority: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            geofence_errors: AtomicU64::new(0),
            ingest_dropped: AtomicU64::new(0),
            pending_exits: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a sample was evaluated with given latency (lock-free)
    #[inline]
    pub fn record_sample_evaluated(&self, latency_us: u64) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_sample_rejected(&self) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry(&self) {
        self.entries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_confirmed(&self) {
        self.exits_confirmed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_cancelled(&self) {
        self.exits_cancelled_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dwell_alert(&self) {
        self.dwell_alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emergency_alert(&self) {
        self.emergency_alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_cooldown(&self) {
        self.notifications_cooldown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_priority(&self) {
        self.notifications_priority.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_error(&self) {
        self.geofence_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an ingest sample dropped due to channel full (lock-free)
    #[inline]
    pub fn record_ingest_dropped(&self) {
        self.ingest_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the pending exit gauge (point-in-time)
    #[inline]
    pub fn set_pending_exits(&self, count: u64) {
        self.pending_exits.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_rejected(&self) -> u64 {
        self.samples_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn entries_total(&self) -> u64 {
        self.entries_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn exits_confirmed_total(&self) -> u64 {
        self.exits_confirmed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn exits_cancelled_total(&self) -> u64 {
        self.exits_cancelled_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifications_cooldown(&self) -> u64 {
        self.notifications_cooldown.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ingest_dropped(&self) -> u64 {
        self.ingest_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pending_exits(&self) -> u64 {
        self.pending_exits.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let samples_count = self.samples_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(samples_count, latency_sum, max_latency, lat_buckets, elapsed)
    }

    /// Summary of the current reporting window without resetting it
    ///
    /// Scrapes use this so they don't eat into the periodic log window.
    pub fn snapshot(&self) -> MetricsSummary {
        let samples_count = self.samples_since_report.load(Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.load(Ordering::Relaxed);
        let max_latency = self.latency_max_us.load(Ordering::Relaxed);
        let lat_buckets = load_buckets(&self.latency_buckets);
        let elapsed = self.last_report_time.lock().elapsed();

        self.summarize(samples_count, latency_sum, max_latency, lat_buckets, elapsed)
    }

    fn summarize(
        &self,
        samples_count: u64,
        latency_sum: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
        elapsed: Duration,
    ) -> MetricsSummary {
        let samples_per_sec = if elapsed.as_secs_f64() > 0.0 {
            samples_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if samples_count > 0 { latency_sum / samples_count } else { 0 };

        MetricsSummary {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            samples_per_sec,
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            avg_eval_latency_us: avg_latency,
            max_eval_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            entries_total: self.entries_total.load(Ordering::Relaxed),
            exits_confirmed_total: self.exits_confirmed_total.load(Ordering::Relaxed),
            exits_cancelled_total: self.exits_cancelled_total.load(Ordering::Relaxed),
            dwell_alerts_total: self.dwell_alerts_total.load(Ordering::Relaxed),
            emergency_alerts_total: self.emergency_alerts_total.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_cooldown: self.notifications_cooldown.load(Ordering::Relaxed),
            notifications_priority: self.notifications_priority.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            geofence_errors: self.geofence_errors.load(Ordering::Relaxed),
            ingest_dropped: self.ingest_dropped.load(Ordering::Relaxed),
            pending_exits: self.pending_exits.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_per_sec: f64,
    pub samples_rejected: u64,
    pub avg_eval_latency_us: u64,
    pub max_eval_latency_us: u64,
    /// Evaluation latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub entries_total: u64,
    pub exits_confirmed_total: u64,
    pub exits_cancelled_total: u64,
    pub dwell_alerts_total: u64,
    pub emergency_alerts_total: u64,
    pub notifications_sent: u64,
    pub notifications_cooldown: u64,
    pub notifications_priority: u64,
    pub notifications_failed: u64,
    pub geofence_errors: u64,
    pub ingest_dropped: u64,
    pub pending_exits: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_per_sec = format!("{:.1}", self.samples_per_sec),
            rejected = %self.samples_rejected,
            avg_latency_us = %self.avg_eval_latency_us,
            max_latency_us = %self.max_eval_latency_us,
            p99_us = %self.lat_p99_us,
            entries = %self.entries_total,
            exits = %self.exits_confirmed_total,
            exits_cancelled = %self.exits_cancelled_total,
            dwell_alerts = %self.dwell_alerts_total,
            emergencies = %self.emergency_alerts_total,
            notified = %self.notifications_sent,
            cooldown_suppressed = %self.notifications_cooldown,
            pending_exits = %self.pending_exits,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.samples_total(), 0);
        assert_eq!(metrics.notifications_sent(), 0);
    }

    #[test]
    fn test_record_sample() {
        let metrics = Metrics::new();
        metrics.record_sample_evaluated(100);
        assert_eq!(metrics.samples_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_sample_evaluated(200);
        assert_eq!(metrics.samples_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_sample_evaluated(100);
        metrics.record_sample_evaluated(200);
        metrics.record_sample_evaluated(300);
        metrics.record_entry();
        metrics.record_notification_sent();

        let summary = metrics.report();
        assert_eq!(summary.samples_total, 3);
        assert_eq!(summary.avg_eval_latency_us, 200);
        assert_eq!(summary.max_eval_latency_us, 300);
        assert_eq!(summary.entries_total, 1);
        assert_eq!(summary.notifications_sent, 1);

        // Periodic counters reset, monotonic ones don't
        let summary = metrics.report();
        assert_eq!(summary.samples_total, 3);
        assert_eq!(summary.avg_eval_latency_us, 0);
        assert_eq!(summary.max_eval_latency_us, 0);
        assert_eq!(summary.entries_total, 1);
    }

    #[test]
    fn test_snapshot_leaves_window_for_report() {
        let metrics = Metrics::new();
        metrics.record_sample_evaluated(150);
        metrics.record_sample_evaluated(250);

        for _ in 0..3 {
            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.avg_eval_latency_us, 200);
            assert_eq!(snapshot.max_eval_latency_us, 250);
            assert_eq!(snapshot.lat_buckets.iter().sum::<u64>(), 2);
        }

        let summary = metrics.report();
        assert_eq!(summary.avg_eval_latency_us, 200);
        assert_eq!(summary.max_eval_latency_us, 250);
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(metrics.snapshot().max_eval_latency_us, 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(60000), 10);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[0] = 90;
        buckets[5] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 100);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 3200);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_pending_exit_gauge() {
        let metrics = Metrics::new();
        metrics.set_pending_exits(4);
        assert_eq!(metrics.pending_exits(), 4);
        metrics.set_pending_exits(1);
        assert_eq!(metrics.report().pending_exits, 1);
    }
}
