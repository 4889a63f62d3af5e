//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Reporting is the only operation that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical counters
//! only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Persist latency bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Sink delivery latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const DELIVERY_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn delivery_bucket_index(latency_ms: u64) -> usize {
    DELIVERY_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(
    buckets: &[u64; NUM_BUCKETS],
    bounds: &[u64; 10],
    percentile: f64,
) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // overflow bucket reports twice the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector shared by the scanner, consumer and dispatcher
#[derive(Debug)]
pub struct Metrics {
    /// Raw decoded codes handed to the scanner session (monotonic)
    scans_total: AtomicU64,
    /// Scan events produced by the tracker (monotonic)
    events_emitted_total: AtomicU64,
    /// Object scans suppressed by the debounce filter (monotonic)
    debounced_total: AtomicU64,
    /// Codes not found in the registry (monotonic)
    unknown_codes_total: AtomicU64,
    /// Object scans before any location was established (monotonic)
    location_missing_total: AtomicU64,
    /// Scan events dropped because the publish queue was full (monotonic)
    publish_dropped_total: AtomicU64,

    /// Events persisted and acknowledged by the consumer (monotonic)
    events_consumed_total: AtomicU64,
    /// Consumed since last report (reset on report)
    consumed_since_report: AtomicU64,
    /// Redelivered events already in the audit store (monotonic)
    duplicate_events_total: AtomicU64,
    /// Payloads that failed to decode (monotonic)
    decode_failures_total: AtomicU64,
    /// Receive-to-ack latency sum (reset on report)
    persist_latency_sum_us: AtomicU64,
    /// Receive-to-ack latency max (reset on report)
    persist_latency_max_us: AtomicU64,
    /// Receive-to-ack latency histogram (reset on report)
    persist_latency_buckets: [AtomicU64; NUM_BUCKETS],

    /// Successful sink deliveries (monotonic)
    deliveries_total: AtomicU64,
    /// Failed sink attempts, retriable or not (monotonic)
    delivery_failures_total: AtomicU64,
    /// Dispatches that ended abandoned (monotonic)
    abandoned_total: AtomicU64,
    /// Attempts rejected by an open circuit breaker (monotonic)
    short_circuited_total: AtomicU64,
    /// Successful delivery latency histogram in ms (reset on report)
    delivery_latency_buckets: [AtomicU64; NUM_BUCKETS],
    delivery_latency_sum_ms: AtomicU64,
    /// Lifetime delivery latency histogram for scraping (never reset)
    delivery_latency_lifetime: [AtomicU64; NUM_BUCKETS],
    delivery_latency_lifetime_sum_ms: AtomicU64,

    /// Events whose fan-out is currently running (gauge)
    dispatch_in_flight: AtomicU64,
    /// Breakers currently open (gauge)
    open_breakers: AtomicU64,

    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans_total: AtomicU64::new(0),
            events_emitted_total: AtomicU64::new(0),
            debounced_total: AtomicU64::new(0),
            unknown_codes_total: AtomicU64::new(0),
            location_missing_total: AtomicU64::new(0),
            publish_dropped_total: AtomicU64::new(0),
            events_consumed_total: AtomicU64::new(0),
            consumed_since_report: AtomicU64::new(0),
            duplicate_events_total: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            persist_latency_sum_us: AtomicU64::new(0),
            persist_latency_max_us: AtomicU64::new(0),
            persist_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            deliveries_total: AtomicU64::new(0),
            delivery_failures_total: AtomicU64::new(0),
            abandoned_total: AtomicU64::new(0),
            short_circuited_total: AtomicU64::new(0),
            delivery_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_latency_sum_ms: AtomicU64::new(0),
            delivery_latency_lifetime: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_latency_lifetime_sum_ms: AtomicU64::new(0),
            dispatch_in_flight: AtomicU64::new(0),
            open_breakers: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_scan(&self) {
        self.scans_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_emitted(&self) {
        self.events_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_debounced(&self) {
        self.debounced_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_code(&self) {
        self.unknown_codes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_missing(&self) {
        self.location_missing_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_dropped(&self) {
        self.publish_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event that was persisted and acknowledged
    #[inline]
    pub fn record_event_consumed(&self, latency_us: u64) {
        self.events_consumed_total.fetch_add(1, Ordering::Relaxed);
        self.consumed_since_report.fetch_add(1, Ordering::Relaxed);
        self.persist_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.persist_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.persist_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_duplicate_event(&self) {
        self.duplicate_events_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery(&self, latency_ms: u64) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        self.delivery_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.delivery_latency_lifetime_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let bucket = delivery_bucket_index(latency_ms);
        self.delivery_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.delivery_latency_lifetime[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failure(&self) {
        self.delivery_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_abandoned(&self) {
        self.abandoned_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_short_circuit(&self) {
        self.short_circuited_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dispatch_started(&self) {
        self.dispatch_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dispatch_finished(&self) {
        // saturating: a stray finish must not wrap the gauge
        let _ = self.dispatch_in_flight.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn breaker_opened(&self) {
        self.open_breakers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn breaker_closed(&self) {
        let _ = self.open_breakers.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn scans_total(&self) -> u64 {
        self.scans_total.load(Ordering::Relaxed)
    }

    pub fn events_emitted_total(&self) -> u64 {
        self.events_emitted_total.load(Ordering::Relaxed)
    }

    pub fn debounced_total(&self) -> u64 {
        self.debounced_total.load(Ordering::Relaxed)
    }

    pub fn unknown_codes_total(&self) -> u64 {
        self.unknown_codes_total.load(Ordering::Relaxed)
    }

    pub fn location_missing_total(&self) -> u64 {
        self.location_missing_total.load(Ordering::Relaxed)
    }

    pub fn events_consumed_total(&self) -> u64 {
        self.events_consumed_total.load(Ordering::Relaxed)
    }

    pub fn duplicate_events_total(&self) -> u64 {
        self.duplicate_events_total.load(Ordering::Relaxed)
    }

    pub fn decode_failures_total(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    pub fn deliveries_total(&self) -> u64 {
        self.deliveries_total.load(Ordering::Relaxed)
    }

    pub fn abandoned_total(&self) -> u64 {
        self.abandoned_total.load(Ordering::Relaxed)
    }

    pub fn short_circuited_total(&self) -> u64 {
        self.short_circuited_total.load(Ordering::Relaxed)
    }

    pub fn delivery_failures_total(&self) -> u64 {
        self.delivery_failures_total.load(Ordering::Relaxed)
    }

    pub fn publish_dropped_total(&self) -> u64 {
        self.publish_dropped_total.load(Ordering::Relaxed)
    }

    /// Lifetime delivery histogram (buckets, sum in ms); unaffected by `report`
    pub fn delivery_histogram(&self) -> ([u64; NUM_BUCKETS], u64) {
        let buckets = std::array::from_fn(|i| self.delivery_latency_lifetime[i].load(Ordering::Relaxed));
        (buckets, self.delivery_latency_lifetime_sum_ms.load(Ordering::Relaxed))
    }

    pub fn dispatch_in_flight(&self) -> u64 {
        self.dispatch_in_flight.load(Ordering::Relaxed)
    }

    pub fn open_breakers(&self) -> u64 {
        self.open_breakers.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let consumed = self.consumed_since_report.swap(0, Ordering::Relaxed);
        let persist_sum = self.persist_latency_sum_us.swap(0, Ordering::Relaxed);
        let persist_max = self.persist_latency_max_us.swap(0, Ordering::Relaxed);
        let persist_buckets = swap_buckets(&self.persist_latency_buckets);
        let delivery_buckets = swap_buckets(&self.delivery_latency_buckets);
        let delivery_sum = self.delivery_latency_sum_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            consumed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let delivered_in_period: u64 = delivery_buckets.iter().sum();

        MetricsSummary {
            scans_total: self.scans_total(),
            events_emitted_total: self.events_emitted_total(),
            debounced_total: self.debounced_total(),
            unknown_codes_total: self.unknown_codes_total(),
            location_missing_total: self.location_missing_total(),
            publish_dropped_total: self.publish_dropped_total(),
            events_consumed_total: self.events_consumed_total(),
            events_per_sec,
            duplicate_events_total: self.duplicate_events_total(),
            decode_failures_total: self.decode_failures_total(),
            persist_avg_us: if consumed > 0 { persist_sum / consumed } else { 0 },
            persist_max_us: persist_max,
            persist_p99_us: percentile_from_buckets(&persist_buckets, &BUCKET_BOUNDS, 0.99),
            persist_buckets,
            deliveries_total: self.deliveries_total(),
            delivery_failures_total: self.delivery_failures_total(),
            abandoned_total: self.abandoned_total(),
            short_circuited_total: self.short_circuited_total(),
            delivery_avg_ms: if delivered_in_period > 0 {
                delivery_sum / delivered_in_period
            } else {
                0
            },
            delivery_p95_ms: percentile_from_buckets(&delivery_buckets, &DELIVERY_BOUNDS, 0.95),
            delivery_buckets,
            dispatch_in_flight: self.dispatch_in_flight(),
            open_breakers: self.open_breakers(),
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
pub const METRICS_DELIVERY_BOUNDS: [u64; 10] = DELIVERY_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub scans_total: u64,
    pub events_emitted_total: u64,
    pub debounced_total: u64,
    pub unknown_codes_total: u64,
    pub location_missing_total: u64,
    pub publish_dropped_total: u64,
    pub events_consumed_total: u64,
    pub events_per_sec: f64,
    pub duplicate_events_total: u64,
    pub decode_failures_total: u64,
    /// Receive-to-ack latency histogram (µs)
    pub persist_buckets: [u64; NUM_BUCKETS],
    pub persist_avg_us: u64,
    pub persist_max_us: u64,
    pub persist_p99_us: u64,
    pub deliveries_total: u64,
    pub delivery_failures_total: u64,
    pub abandoned_total: u64,
    pub short_circuited_total: u64,
    /// Successful delivery latency histogram (ms)
    pub delivery_buckets: [u64; NUM_BUCKETS],
    pub delivery_avg_ms: u64,
    pub delivery_p95_ms: u64,
    pub dispatch_in_flight: u64,
    pub open_breakers: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            consumed_total = %self.events_consumed_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            duplicates = %self.duplicate_events_total,
            decode_failures = %self.decode_failures_total,
            persist_avg_us = %self.persist_avg_us,
            persist_p99_us = %self.persist_p99_us,
            delivered = %self.deliveries_total,
            failures = %self.delivery_failures_total,
            abandoned = %self.abandoned_total,
            short_circuited = %self.short_circuited_total,
            delivery_p95_ms = %self.delivery_p95_ms,
            in_flight = %self.dispatch_in_flight,
            open_breakers = %self.open_breakers,
            "metrics"
        );
    }
}
