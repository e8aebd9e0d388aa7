//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::{AuthorizationOutcome, GateState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Authorization latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;
const NUM_OUTCOMES: usize = 5;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Plate events received from the recognizer (monotonic)
    plates_received: AtomicU64,
    /// Plate events refused by validation (monotonic)
    plates_rejected: AtomicU64,
    /// Plate events dropped because the gate was mid-cycle (monotonic)
    plates_dropped_busy: AtomicU64,
    /// Authorization outcomes, indexed by `AuthorizationOutcome::index`
    outcomes: [AtomicU64; NUM_OUTCOMES],
    /// Authorization latency histogram (cumulative since start)
    auth_latency_buckets: [AtomicU64; NUM_BUCKETS],
    auth_latency_sum_ms: AtomicU64,
    /// Max authorization latency (reset on report)
    auth_latency_max_ms: AtomicU64,
    /// Completed open/close cycles (monotonic)
    gate_cycles_total: AtomicU64,
    /// Current gate state gauge (see `GateState::gauge`)
    gate_state: AtomicU64,
    /// Decision records dropped because the egress channel was full
    decisions_dropped: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            plates_received: AtomicU64::new(0),
            plates_rejected: AtomicU64::new(0),
            plates_dropped_busy: AtomicU64::new(0),
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            auth_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            auth_latency_sum_ms: AtomicU64::new(0),
            auth_latency_max_ms: AtomicU64::new(0),
            gate_cycles_total: AtomicU64::new(0),
            gate_state: AtomicU64::new(GateState::Closed.gauge()),
            decisions_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_plate_received(&self) {
        self.plates_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plate_rejected(&self) {
        self.plates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plate_dropped_busy(&self) {
        self.plates_dropped_busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolved authorization with its latency (lock-free)
    #[inline]
    pub fn record_authorization(&self, outcome: AuthorizationOutcome, latency_ms: u64) {
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
        self.auth_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.auth_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.auth_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_gate_cycle(&self) {
        self.gate_cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_gate_state(&self, state: GateState) {
        self.gate_state.store(state.gauge(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decision_dropped(&self) {
        self.decisions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn plates_received(&self) -> u64 {
        self.plates_received.load(Ordering::Relaxed)
    }

    pub fn plates_rejected(&self) -> u64 {
        self.plates_rejected.load(Ordering::Relaxed)
    }

    pub fn plates_dropped_busy(&self) -> u64 {
        self.plates_dropped_busy.load(Ordering::Relaxed)
    }

    pub fn outcome_count(&self, outcome: AuthorizationOutcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn gate_cycles_total(&self) -> u64 {
        self.gate_cycles_total.load(Ordering::Relaxed)
    }

    pub fn gate_state(&self) -> u64 {
        self.gate_state.load(Ordering::Relaxed)
    }

    /// Take a snapshot; resets only the per-interval max
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let buckets = load_buckets(&self.auth_latency_buckets);
        let auth_total: u64 = buckets.iter().sum();
        let auth_latency_sum_ms = self.auth_latency_sum_ms.load(Ordering::Relaxed);
        let outcomes = std::array::from_fn(|i| self.outcomes[i].load(Ordering::Relaxed));

        MetricsSummary {
            interval_secs: elapsed_secs,
            plates_received: self.plates_received(),
            plates_rejected: self.plates_rejected(),
            plates_dropped_busy: self.plates_dropped_busy(),
            outcomes,
            auth_total,
            auth_latency_sum_ms,
            auth_latency_avg_ms: if auth_total > 0 { auth_latency_sum_ms / auth_total } else { 0 },
            auth_latency_max_ms: self.auth_latency_max_ms.swap(0, Ordering::Relaxed),
            auth_latency_p50_ms: percentile_from_buckets(&buckets, 0.50),
            auth_latency_p99_ms: percentile_from_buckets(&buckets, 0.99),
            auth_latency_buckets: buckets,
            gate_cycles_total: self.gate_cycles_total(),
            gate_state: self.gate_state(),
            decisions_dropped: self.decisions_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Bucket bounds exported for the Prometheus endpoint
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Point-in-time view of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub interval_secs: f64,
    pub plates_received: u64,
    pub plates_rejected: u64,
    pub plates_dropped_busy: u64,
    pub outcomes: [u64; NUM_OUTCOMES],
    pub auth_total: u64,
    pub auth_latency_sum_ms: u64,
    pub auth_latency_avg_ms: u64,
    pub auth_latency_max_ms: u64,
    pub auth_latency_p50_ms: u64,
    pub auth_latency_p99_ms: u64,
    pub auth_latency_buckets: [u64; NUM_BUCKETS],
    pub gate_cycles_total: u64,
    pub gate_state: u64,
    pub decisions_dropped: u64,
}

impl MetricsSummary {
    pub fn outcome(&self, outcome: AuthorizationOutcome) -> u64 {
        self.outcomes[outcome.index()]
    }

    /// Log the summary as a single structured event
    pub fn log(&self) {
        info!(
            plates_received = %self.plates_received,
            plates_rejected = %self.plates_rejected,
            plates_dropped_busy = %self.plates_dropped_busy,
            authorized = %self.outcome(AuthorizationOutcome::Authorized),
            denied = %self.outcome(AuthorizationOutcome::Denied),
            timeout = %self.outcome(AuthorizationOutcome::Timeout),
            unavailable = %self.outcome(AuthorizationOutcome::ControllerUnavailable),
            malformed = %self.outcome(AuthorizationOutcome::MalformedResponse),
            auth_avg_ms = %self.auth_latency_avg_ms,
            auth_p99_ms = %self.auth_latency_p99_ms,
            auth_max_ms = %self.auth_latency_max_ms,
            gate_cycles = %self.gate_cycles_total,
            gate_state = %self.gate_state,
            "metrics_summary"
        );
    }
}
