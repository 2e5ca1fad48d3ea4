use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::clock::Clock;

pub mod report;
pub mod reservoir;
pub mod thresholds;

use reservoir::{percentile_of_sorted, Reservoir};

/// Result record of one workload iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Run-relative time the iteration finished.
    pub timestamp: Duration,
    pub latency_ms: f64,
    pub success: bool,
    pub tag: String,
    pub vu: u32,
    pub error: Option<String>,
    /// Set when the iteration was force-stopped after the grace period.
    pub cancelled: bool,
}

impl Outcome {
    pub fn success(vu: u32, tag: impl Into<String>, timestamp: Duration, latency_ms: f64) -> Self {
        Self {
            timestamp,
            latency_ms,
            success: true,
            tag: tag.into(),
            vu,
            error: None,
            cancelled: false,
        }
    }

    pub fn failure(
        vu: u32,
        tag: impl Into<String>,
        timestamp: Duration,
        latency_ms: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            latency_ms,
            success: false,
            tag: tag.into(),
            vu,
            error: Some(error.into()),
            cancelled: false,
        }
    }
}

/// Which slice of run time a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Everything since the run started.
    Cumulative,
    /// The trailing span of run time, rounded out to whole seconds.
    Trailing(Duration),
}

/// Aggregate over one span of run time. Owned by a collector shard.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    pub count: u64,
    pub fail_count: u64,
    pub latency_sum: f64,
    pub min: Option<f64>,
    pub max: f64,
    pub samples: Reservoir,
    pub window_start: Duration,
    pub window_end: Duration,
}

impl MetricWindow {
    fn new(window_start: Duration, capacity: usize, seed: u64) -> Self {
        Self {
            count: 0,
            fail_count: 0,
            latency_sum: 0.0,
            min: None,
            max: 0.0,
            samples: Reservoir::new(capacity, seed),
            window_start,
            window_end: window_start,
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        self.count += 1;
        if !outcome.success {
            self.fail_count += 1;
        }
        self.latency_sum += outcome.latency_ms;
        if self.min.is_none_or(|m| outcome.latency_ms < m) {
            self.min = Some(outcome.latency_ms);
        }
        if outcome.latency_ms > self.max {
            self.max = outcome.latency_ms;
        }
        self.samples.record(outcome.latency_ms);
        if outcome.timestamp > self.window_end {
            self.window_end = outcome.timestamp;
        }
    }

    fn merge(&mut self, other: &MetricWindow) {
        self.count += other.count;
        self.fail_count += other.fail_count;
        self.latency_sum += other.latency_sum;
        if let Some(m) = other.min {
            if self.min.is_none_or(|cur| m < cur) {
                self.min = Some(m);
            }
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.samples.merge(&other.samples);
        self.window_start = self.window_start.min(other.window_start);
        self.window_end = self.window_end.max(other.window_end);
    }

    fn snapshot(&self) -> MetricSnapshot {
        let mut sorted = self.samples.samples().to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let span = self.window_end.saturating_sub(self.window_start);
        MetricSnapshot {
            count: self.count,
            fail_count: self.fail_count,
            rate: ratio(self.fail_count, self.count),
            avg: if self.count > 0 {
                self.latency_sum / self.count as f64
            } else {
                0.0
            },
            min: self.min.unwrap_or(0.0),
            max: self.max,
            p50: percentile_of_sorted(&sorted, 50.0),
            p90: percentile_of_sorted(&sorted, 90.0),
            p95: percentile_of_sorted(&sorted, 95.0),
            p99: percentile_of_sorted(&sorted, 99.0),
            throughput: if span.is_zero() {
                self.count as f64
            } else {
                self.count as f64 / span.as_secs_f64()
            },
            sorted_latencies: sorted,
            exact: self.samples.is_exact(),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Read-only view of aggregated metrics. Latencies are in milliseconds;
/// `rate` is the failure ratio.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricSnapshot {
    pub count: u64,
    pub fail_count: u64,
    pub rate: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    /// Iterations per second over the span the window covers.
    pub throughput: f64,
    sorted_latencies: Vec<f64>,
    /// False once reservoir sampling has kicked in.
    pub exact: bool,
}

impl MetricSnapshot {
    /// Nearest-rank percentile, `q` in `0..=100`.
    pub fn percentile(&self, q: f64) -> f64 {
        percentile_of_sorted(&self.sorted_latencies, q)
    }

    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            1.0 - self.rate
        }
    }
}

pub struct TagStats {
    pub count: u64,
    pub failures: u64,
    pub histogram: Histogram<u64>,
}

impl TagStats {
    fn new() -> Self {
        Self {
            count: 0,
            failures: 0,
            // 1us .. 1h, 2 significant digits
            histogram: Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2)
                .expect("static histogram bounds are valid"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub shards: usize,
    pub sample_capacity: usize,
    pub bucket_sample_capacity: usize,
    pub retained_buckets: u64,
    pub seed: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            sample_capacity: reservoir::DEFAULT_CAPACITY,
            bucket_sample_capacity: 1_000,
            retained_buckets: 300,
            seed: 0,
        }
    }
}

impl CollectorConfig {
    /// Shard count for a run peaking at `max_vus`: roughly 100 VUs per shard.
    pub fn for_vus(max_vus: u32, seed: u64) -> Self {
        Self {
            shards: (max_vus as usize / 100).clamp(16, 256),
            seed,
            ..Self::default()
        }
    }
}

struct Shard {
    cumulative: MetricWindow,
    /// One-second windows keyed by second index.
    buckets: BTreeMap<u64, MetricWindow>,
    tags: HashMap<String, TagStats>,
    errors: HashMap<String, u64>,
    cancelled: u64,
}

impl Shard {
    fn new(config: &CollectorConfig, index: usize) -> Self {
        Self {
            cumulative: MetricWindow::new(
                Duration::ZERO,
                config.sample_capacity,
                config.seed.wrapping_add(index as u64),
            ),
            buckets: BTreeMap::new(),
            tags: HashMap::new(),
            errors: HashMap::new(),
            cancelled: 0,
        }
    }
}

/// Thread-safe outcome aggregator.
///
/// Outcomes land in one of N shards picked by `vu % N`, each behind its own
/// lock, so concurrent VUs rarely contend. Every aggregate is a sum, min, max
/// or a sample union, so the merged result does not depend on ingest order.
pub struct MetricsCollector {
    shards: Vec<Mutex<Shard>>,
    config: CollectorConfig,
    clock: Arc<dyn Clock>,
}

pub type SharedCollector = Arc<MetricsCollector>;

impl MetricsCollector {
    pub fn new(config: CollectorConfig, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|i| Mutex::new(Shard::new(&config, i)))
            .collect();
        Self {
            shards,
            config,
            clock,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn ingest(&self, outcome: Outcome) {
        let idx = outcome.vu as usize % self.shards.len();
        let mut shard = self.shards[idx].lock();

        shard.cumulative.record(&outcome);

        let second = outcome.timestamp.as_secs();
        let newest = shard
            .buckets
            .keys()
            .next_back()
            .map_or(second, |&n| n.max(second));
        let horizon = newest.saturating_sub(self.config.retained_buckets.max(1) - 1);
        if second >= horizon {
            let cap = self.config.bucket_sample_capacity;
            let seed = self.config.seed.wrapping_add(second);
            shard
                .buckets
                .entry(second)
                .or_insert_with(|| MetricWindow::new(Duration::from_secs(second), cap, seed))
                .record(&outcome);
            while shard
                .buckets
                .first_key_value()
                .is_some_and(|(&oldest, _)| oldest < horizon)
            {
                shard.buckets.pop_first();
            }
        }

        let tag = shard.tags.entry(outcome.tag.clone()).or_insert_with(TagStats::new);
        tag.count += 1;
        if !outcome.success {
            tag.failures += 1;
        }
        let micros = (outcome.latency_ms * 1000.0).round().max(1.0) as u64;
        tag.histogram.saturating_record(micros);

        if let Some(err) = outcome.error {
            *shard.errors.entry(err).or_insert(0) += 1;
        }
        if outcome.cancelled {
            shard.cancelled += 1;
        }
    }

    fn merged_window(&self, spec: WindowSpec) -> MetricWindow {
        let mut merged = MetricWindow::new(
            Duration::ZERO,
            self.config.sample_capacity,
            self.config.seed,
        );
        match spec {
            WindowSpec::Cumulative => {
                for shard in &self.shards {
                    merged.merge(&shard.lock().cumulative);
                }
            }
            WindowSpec::Trailing(span) => {
                let now = self.clock.elapsed();
                let from = now.saturating_sub(span).as_secs();
                merged.window_start = Duration::from_secs(from);
                merged.window_end = merged.window_start;
                for shard in &self.shards {
                    let shard = shard.lock();
                    for (_, bucket) in shard.buckets.range(from..) {
                        merged.merge(bucket);
                    }
                }
                merged.window_end = merged.window_end.max(now);
            }
        }
        merged
    }

    pub fn snapshot(&self, spec: WindowSpec) -> MetricSnapshot {
        self.merged_window(spec).snapshot()
    }

    pub fn summary(&self) -> report::MetricSummary {
        let window = self.merged_window(WindowSpec::Cumulative);
        let snap = window.snapshot();

        let mut errors: BTreeMap<String, u64> = BTreeMap::new();
        let mut tag_totals: BTreeMap<String, (u64, u64, Histogram<u64>)> = BTreeMap::new();
        let mut cancelled = 0;
        for shard in &self.shards {
            let shard = shard.lock();
            cancelled += shard.cancelled;
            for (err, n) in &shard.errors {
                *errors.entry(err.clone()).or_insert(0) += n;
            }
            for (name, stats) in &shard.tags {
                let entry = tag_totals
                    .entry(name.clone())
                    .or_insert_with(|| (0, 0, TagStats::new().histogram));
                entry.0 += stats.count;
                entry.1 += stats.failures;
                entry.2.add(&stats.histogram).ok();
            }
        }

        let tags = tag_totals
            .into_iter()
            .map(|(name, (count, failures, hist))| {
                let micros_to_ms = |q: f64| hist.value_at_quantile(q) as f64 / 1000.0;
                (
                    name,
                    report::TagSummary {
                        count,
                        failures,
                        fail_rate: ratio(failures, count),
                        p95_ms: micros_to_ms(0.95),
                        p99_ms: micros_to_ms(0.99),
                        max_ms: hist.max() as f64 / 1000.0,
                    },
                )
            })
            .collect();

        report::MetricSummary {
            total: snap.count,
            failed: snap.fail_count,
            cancelled,
            fail_rate: snap.rate,
            avg_ms: snap.avg,
            min_ms: snap.min,
            max_ms: snap.max,
            p50_ms: snap.p50,
            p90_ms: snap.p90,
            p95_ms: snap.p95,
            p99_ms: snap.p99,
            throughput: snap.throughput,
            exact_percentiles: snap.exact,
            errors,
            tags,
        }
    }
}
