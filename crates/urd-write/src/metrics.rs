//! In-process write-path telemetry.
//!
//! Counters are plain relaxed atomics and fixed-bucket histograms so the
//! apply thread can update them without locking; a poller turns the raw
//! counts into rates and percentiles. One [`WriteMetrics`] exists per
//! partition, created with the write service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use urd_types::ReplicaId;

use urd_storage::fjall::now_us;

/// Histogram bucket upper bounds. Unit-agnostic: per-op latencies record
/// microseconds, the duplication time lag records milliseconds.
const BUCKET_BOUNDS: [u64; 13] =
    [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 1_000_000];

/// Fixed-bucket histogram with an overflow bucket.
#[derive(Debug)]
pub struct LatencyHistogram {
    counts: [AtomicU64; BUCKET_BOUNDS.len() + 1],
    count: AtomicU64,
    total: AtomicU64,
    max: AtomicU64,
}

/// Point-in-time percentile view of a [`LatencyHistogram`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        LatencyHistogram {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    /// Record one observation.
    pub fn record(&self, v: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(v, Ordering::Relaxed);
        self.max.fetch_max(v, Ordering::Relaxed);
        let idx = BUCKET_BOUNDS.iter().position(|upper| v <= *upper).unwrap_or(BUCKET_BOUNDS.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let mut buckets = [0u64; BUCKET_BOUNDS.len() + 1];
        for (i, c) in self.counts.iter().enumerate() {
            buckets[i] = c.load(Ordering::Relaxed);
        }
        let max = self.max.load(Ordering::Relaxed);
        LatencySnapshot {
            count: self.count.load(Ordering::Relaxed),
            p50: percentile(&buckets, 50.0, max),
            p95: percentile(&buckets, 95.0, max),
            p99: percentile(&buckets, 99.0, max),
            max,
        }
    }
}

fn percentile(buckets: &[u64; BUCKET_BOUNDS.len() + 1], p: f64, max: u64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }
    let target = (total as f64 * p / 100.0).ceil() as u64;
    let mut seen = 0u64;
    for (i, c) in buckets.iter().enumerate() {
        seen += c;
        if seen >= target {
            return if i < BUCKET_BOUNDS.len() { BUCKET_BOUNDS[i] } else { max };
        }
    }
    max
}

/// QPS count plus latency distribution for one opcode.
#[derive(Debug, Default)]
pub struct OpMetrics {
    qps: AtomicU64,
    pub latency: LatencyHistogram,
}

impl OpMetrics {
    pub fn incr_qps(&self) {
        self.qps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn qps_count(&self) -> u64 {
        self.qps.load(Ordering::Relaxed)
    }
}

/// All write-path counters for one partition.
#[derive(Debug)]
pub struct WriteMetrics {
    pub replica: ReplicaId,

    pub put: OpMetrics,
    pub remove: OpMetrics,
    pub multi_put: OpMetrics,
    pub multi_remove: OpMetrics,
    pub incr: OpMetrics,
    pub check_and_set: OpMetrics,
    pub check_and_mutate: OpMetrics,

    pub duplicate_qps: AtomicU64,
    /// Master-to-slave time lag of replayed writes, in milliseconds.
    pub dup_time_lag_ms: LatencyHistogram,
    pub dup_lagging_writes: AtomicU64,

    pub read_cu: AtomicU64,
    pub write_cu: AtomicU64,

    pub get_bytes: AtomicU64,
    pub multi_get_bytes: AtomicU64,
    pub scan_bytes: AtomicU64,
    pub put_bytes: AtomicU64,
    pub multi_put_bytes: AtomicU64,
    pub check_and_set_bytes: AtomicU64,
    pub check_and_mutate_bytes: AtomicU64,
}

impl WriteMetrics {
    pub fn new(replica: ReplicaId) -> Arc<Self> {
        Arc::new(WriteMetrics {
            replica,
            put: OpMetrics::default(),
            remove: OpMetrics::default(),
            multi_put: OpMetrics::default(),
            multi_remove: OpMetrics::default(),
            incr: OpMetrics::default(),
            check_and_set: OpMetrics::default(),
            check_and_mutate: OpMetrics::default(),
            duplicate_qps: AtomicU64::new(0),
            dup_time_lag_ms: LatencyHistogram::default(),
            dup_lagging_writes: AtomicU64::new(0),
            read_cu: AtomicU64::new(0),
            write_cu: AtomicU64::new(0),
            get_bytes: AtomicU64::new(0),
            multi_get_bytes: AtomicU64::new(0),
            scan_bytes: AtomicU64::new(0),
            put_bytes: AtomicU64::new(0),
            multi_put_bytes: AtomicU64::new(0),
            check_and_set_bytes: AtomicU64::new(0),
            check_and_mutate_bytes: AtomicU64::new(0),
        })
    }
}

/// Records the duplication time lag when dropped, so every exit path of the
/// duplicate handler is covered.
pub struct DupLagGuard {
    metrics: Arc<WriteMetrics>,
    origin_timestamp_us: u64,
    threshold_ms: u64,
}

impl DupLagGuard {
    pub fn new(metrics: Arc<WriteMetrics>, origin_timestamp_us: u64, threshold_ms: u64) -> Self {
        DupLagGuard { metrics, origin_timestamp_us, threshold_ms }
    }
}

impl Drop for DupLagGuard {
    fn drop(&mut self) {
        let lag_ms = now_us().saturating_sub(self.origin_timestamp_us) / 1000;
        if lag_ms > self.threshold_ms {
            self.metrics.dup_lagging_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.dup_time_lag_ms.record(lag_ms);
    }
}
