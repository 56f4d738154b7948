use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metric::{Sample, Verdict};

/// The `Aggregate` trait defines how raw samples are collected and combined
/// into an intermediate, mergeable representation.
///
/// Aggregates should **not** compute final statistics such as averages or
/// percentiles; that belongs in [`crate::report::RunSummary`], which is derived
/// from an aggregate once a snapshot is taken. Aggregates store compact raw
/// data (counts, sums, histograms) so that reports can be computed later
/// without losing information.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: shard-local
///   aggregates are merged in arbitrary order.
/// - `consume` sits on the hot path of every virtual user; keep it cheap.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The sample type this aggregate summarizes.
    type Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single sample into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Request counters, either for the whole run or for one task.
///
/// `successes` includes business rejections; `business_rejections` is kept on
/// the side so reports can tell them apart. Recovered auth expiries are neither
/// successes nor failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub requests: u64,
    pub successes: u64,
    pub business_rejections: u64,
    pub auth_recovered: u64,
    pub auth_expired: u64,
    pub transport_failures: u64,
    pub total_latency: Duration,
}

impl Counters {
    fn record(&mut self, verdict: Verdict, latency: Duration) {
        self.requests += 1;
        self.total_latency += latency;
        match verdict {
            Verdict::Success => self.successes += 1,
            Verdict::BusinessRejection => {
                self.successes += 1;
                self.business_rejections += 1;
            }
            Verdict::AuthRecovered => self.auth_recovered += 1,
            Verdict::AuthExpired => self.auth_expired += 1,
            Verdict::TransportFailure => self.transport_failures += 1,
        }
    }

    fn merge(&mut self, other: &Counters) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.business_rejections += other.business_rejections;
        self.auth_recovered += other.auth_recovered;
        self.auth_expired += other.auth_expired;
        self.transport_failures += other.transport_failures;
        self.total_latency += other.total_latency;
    }

    pub fn failures(&self) -> u64 {
        self.auth_expired + self.transport_failures
    }
}

/// Token acquisition counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCounters {
    pub attempts: u64,
    pub failures: u64,
    pub total_latency: Duration,
}

/// Everything recorded during a run: totals, a per-task breakdown, token
/// acquisition counters and a request latency histogram (microseconds).
#[derive(Clone, Debug)]
pub struct RunStats {
    pub requests: Counters,
    pub by_task: BTreeMap<String, Counters>,
    pub auth: AuthCounters,
    latency: Histogram<u64>,
}

impl RunStats {
    pub fn latency(&self) -> &Histogram<u64> {
        &self.latency
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregate for RunStats {
    type Metric = Sample;

    fn new() -> Self {
        Self {
            requests: Counters::default(),
            by_task: BTreeMap::new(),
            auth: AuthCounters::default(),
            // auto-resizing; 3 significant figures is always a valid precision
            latency: Histogram::new(3).expect("3 significant figures is a valid precision"),
        }
    }

    fn consume(&mut self, metric: &Sample) {
        match metric {
            Sample::Request {
                task,
                latency,
                verdict,
                ..
            } => {
                self.requests.record(*verdict, *latency);
                match self.by_task.get_mut(task.as_ref()) {
                    Some(counters) => counters.record(*verdict, *latency),
                    None => {
                        let mut counters = Counters::default();
                        counters.record(*verdict, *latency);
                        self.by_task.insert(task.to_string(), counters);
                    }
                }
                let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
                if let Err(e) = self.latency.record(micros.max(1)) {
                    tracing::warn!("Dropping latency sample of {micros}us: {e}");
                }
            }
            Sample::Token { latency, acquired } => {
                self.auth.attempts += 1;
                self.auth.total_latency += *latency;
                if !acquired {
                    self.auth.failures += 1;
                }
            }
        }
    }

    fn merge(&mut self, other: Self) {
        self.requests.merge(&other.requests);
        for (task, counters) in other.by_task {
            self.by_task.entry(task).or_default().merge(&counters);
        }
        self.auth.attempts += other.auth.attempts;
        self.auth.failures += other.auth.failures;
        self.auth.total_latency += other.auth.total_latency;
        if let Err(e) = self.latency.add(&other.latency) {
            tracing::warn!("Dropping latency samples while merging histograms: {e}");
        }
    }
}

/// Thread-safe sink every virtual user records into.
///
/// Writes are spread over a fixed set of lock-protected shards (one per CPU by
/// default) keyed by the writer, so users on different shards never contend.
/// [`MetricsSink::snapshot`] locks each shard just long enough to clone it and
/// merges the copies; readers get a snapshot, never a live view.
#[derive(Clone)]
pub struct MetricsSink {
    shards: Arc<[Mutex<RunStats>]>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get())
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards: Vec<_> = (0..shards.max(1))
            .map(|_| Mutex::new(RunStats::new()))
            .collect();
        Self {
            shards: shards.into(),
        }
    }

    /// Record one sample. `key` picks the shard; virtual users pass their id.
    pub fn record(&self, key: u64, sample: &Sample) {
        let idx = (key % self.shards.len() as u64) as usize;
        self.shards[idx].lock().consume(sample);
    }

    pub fn snapshot(&self) -> RunStats {
        let mut total = RunStats::new();
        for shard in self.shards.iter() {
            let copy = shard.lock().clone();
            total.merge(copy);
        }
        total
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}
