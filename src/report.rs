use std::{fmt, future::Future, path::PathBuf, time::Duration};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Counters, MetricsSink, RunStats},
    error::Result,
    scheduler::{RunOutcome, TickRecord},
};

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn mean_millis(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        millis(total) / count as f64
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Latency distribution in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
}

impl From<&Histogram<u64>> for LatencyStats {
    /// The histogram records microseconds.
    fn from(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        let ms = |micros: u64| micros as f64 / 1000.0;
        Self {
            min: ms(hist.min()),
            p50: ms(hist.value_at_quantile(0.50)),
            p95: ms(hist.value_at_quantile(0.95)),
            p99: ms(hist.value_at_quantile(0.99)),
            max: ms(hist.max()),
            mean: hist.mean() / 1000.0,
            count: hist.len(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub name: String,
    pub requests: u64,
    pub successes: u64,
    pub business_rejections: u64,
    pub auth_recovered: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
}

impl TaskSummary {
    fn new(name: &str, counters: &Counters) -> Self {
        Self {
            name: name.to_string(),
            requests: counters.requests,
            successes: counters.successes,
            business_rejections: counters.business_rejections,
            auth_recovered: counters.auth_recovered,
            failures: counters.failures(),
            mean_latency_ms: mean_millis(counters.total_latency, counters.requests),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSummary {
    pub attempts: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
}

/// One scheduler tick, flattened for output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub elapsed_secs: f64,
    pub target: usize,
    pub live: usize,
    pub spawned: usize,
    pub retired: usize,
    pub retiring: usize,
}

impl From<&TickRecord> for TimelinePoint {
    fn from(tick: &TickRecord) -> Self {
        Self {
            elapsed_secs: tick.elapsed.as_secs_f64(),
            target: tick.target,
            live: tick.live,
            spawned: tick.spawned,
            retired: tick.retired,
            retiring: tick.retiring,
        }
    }
}

/// Final statistics of a run (or of a run so far).
///
/// A pure data structure derived from [`RunStats`]: rates, ratios and latency
/// percentiles are computed here and nowhere else. Business rejections count as
/// successes; recovered auth expiries count as neither.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub requests: u64,
    pub successes: u64,
    pub business_rejections: u64,
    pub auth_recovered: u64,
    pub auth_expired: u64,
    pub transport_failures: u64,
    pub failures: u64,
    pub success_ratio: f64,
    pub throughput_rps: f64,
    pub latency: LatencyStats,
    pub auth: AuthSummary,
    pub live_users: usize,
    pub target_users: usize,
    pub peak_users: usize,
    pub spawned_users: u64,
    pub abandoned_users: u64,
    pub tasks: Vec<TaskSummary>,
    pub timeline: Vec<TimelinePoint>,
}

impl RunSummary {
    /// Summary of the counters alone; population fields stay zero.
    pub fn new(stats: &RunStats, elapsed: Duration) -> Self {
        let totals = &stats.requests;
        let secs = elapsed.as_secs_f64();
        Self {
            elapsed_secs: secs,
            requests: totals.requests,
            successes: totals.successes,
            business_rejections: totals.business_rejections,
            auth_recovered: totals.auth_recovered,
            auth_expired: totals.auth_expired,
            transport_failures: totals.transport_failures,
            failures: totals.failures(),
            success_ratio: ratio(totals.successes, totals.requests),
            throughput_rps: if secs > 0.0 {
                totals.requests as f64 / secs
            } else {
                0.0
            },
            latency: stats.latency().into(),
            auth: AuthSummary {
                attempts: stats.auth.attempts,
                failures: stats.auth.failures,
                mean_latency_ms: mean_millis(stats.auth.total_latency, stats.auth.attempts),
            },
            tasks: stats
                .by_task
                .iter()
                .map(|(name, counters)| TaskSummary::new(name, counters))
                .collect(),
            ..Default::default()
        }
    }

    /// Snapshot taken while the run is going.
    pub fn live(stats: &RunStats, elapsed: Duration, tick: &TickRecord) -> Self {
        Self {
            live_users: tick.live,
            target_users: tick.target,
            ..Self::new(stats, elapsed)
        }
    }
}

impl From<&RunOutcome> for RunSummary {
    fn from(outcome: &RunOutcome) -> Self {
        let last = outcome.timeline.last().copied().unwrap_or_default();
        Self {
            live_users: last.live,
            target_users: last.target,
            peak_users: outcome.peak_users,
            spawned_users: outcome.spawned_users,
            abandoned_users: outcome.abandoned_users,
            timeline: outcome.timeline.iter().map(TimelinePoint::from).collect(),
            ..Self::new(&outcome.stats, outcome.elapsed)
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Elapsed {:.1}s, {} requests ({:.2}/s), peak {} users",
            self.elapsed_secs, self.requests, self.throughput_rps, self.peak_users
        )?;
        writeln!(
            f,
            "  successes {} ({:.2}%), business rejections {}, auth recovered {}",
            self.successes,
            self.success_ratio * 100.0,
            self.business_rejections,
            self.auth_recovered
        )?;
        writeln!(
            f,
            "  failures {} (auth expired {}, transport {})",
            self.failures, self.auth_expired, self.transport_failures
        )?;
        let l = &self.latency;
        writeln!(
            f,
            "  latency ms: min {:.1} p50 {:.1} p95 {:.1} p99 {:.1} max {:.1} mean {:.1}",
            l.min, l.p50, l.p95, l.p99, l.max, l.mean
        )?;
        writeln!(
            f,
            "  token requests {} (failed {}, mean {:.1}ms)",
            self.auth.attempts, self.auth.failures, self.auth.mean_latency_ms
        )?;
        if self.abandoned_users > 0 {
            writeln!(f, "  users abandoned after auth failures: {}", self.abandoned_users)?;
        }
        if !self.tasks.is_empty() {
            writeln!(
                f,
                "  {:<32} {:>9} {:>9} {:>9} {:>10}",
                "task", "requests", "ok", "failed", "mean ms"
            )?;
            for task in &self.tasks {
                writeln!(
                    f,
                    "  {:<32} {:>9} {:>9} {:>9} {:>10.1}",
                    task.name, task.requests, task.successes, task.failures, task.mean_latency_ms
                )?;
            }
        }
        Ok(())
    }
}

/// A [`Reporter`] consumes a [`RunSummary`] and performs side effects:
/// displaying it, persisting it, or sending it somewhere.
///
/// Reporters are the I/O boundary; summaries themselves stay pure.
///
/// # Example
/// ```rust
/// use suru::report::{Reporter, RunSummary};
///
/// struct Stdout;
///
/// impl Reporter for Stdout {
///     async fn report(&self, summary: &RunSummary) -> suru::Result<()> {
///         println!("{summary}");
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, summary: &RunSummary) -> impl Future<Output = Result<()>>;
}

/// Prints summaries. Headless runs log through `tracing`; interactive runs
/// write a table to stdout.
#[derive(Clone, Copy, Debug)]
pub struct ConsoleReporter {
    pub headless: bool,
}

impl ConsoleReporter {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

impl Reporter for ConsoleReporter {
    async fn report(&self, summary: &RunSummary) -> Result<()> {
        if self.headless {
            for line in summary.to_string().lines() {
                tracing::info!("{line}");
            }
        } else {
            println!("\n===== Run summary =====\n{summary}");
        }
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON.
#[derive(Clone, Debug)]
pub struct JsonFileReporter {
    pub path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonFileReporter {
    async fn report(&self, summary: &RunSummary) -> Result<()> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Report written to {}", self.path.display());
        Ok(())
    }
}

/// Report live metrics every `every` until `cancel` fires.
pub async fn periodic_reporter(
    sink: MetricsSink,
    ticks: watch::Receiver<TickRecord>,
    every: Duration,
    headless: bool,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let tick = *ticks.borrow();
        let summary = RunSummary::live(&sink.snapshot(), start.elapsed(), &tick);
        if headless {
            tracing::info!(
                "{:>7.1}s | users {}/{} | requests {} ({:.1}/s) | failures {} | p95 {:.1}ms",
                summary.elapsed_secs,
                summary.live_users,
                summary.target_users,
                summary.requests,
                summary.throughput_rps,
                summary.failures,
                summary.latency.p95
            );
        } else {
            print!("\x1B[2J\x1B[1;1H");
            println!(
                "Users {}/{}  [Ctrl+C to stop]\n{summary}",
                summary.live_users, summary.target_users
            );
        }
    }
    tracing::debug!("Periodic reporter stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::Aggregate,
        metric::{Sample, Verdict},
    };

    fn request(task: &str, verdict: Verdict, ms: u64) -> Sample {
        Sample::Request {
            task: task.into(),
            status: Some(200),
            latency: Duration::from_millis(ms),
            verdict,
        }
    }

    fn stats() -> RunStats {
        let mut stats = RunStats::new();
        stats.aggregate(&[
            request("list", Verdict::Success, 10),
            request("list", Verdict::Success, 20),
            request("create", Verdict::BusinessRejection, 30),
            request("create", Verdict::TransportFailure, 40),
        ]);
        stats.consume(&Sample::Token {
            latency: Duration::from_millis(8),
            acquired: true,
        });
        stats
    }

    #[test]
    fn summary_computes_rates_and_ratios() {
        let summary = RunSummary::new(&stats(), Duration::from_secs(2));

        assert_eq!(summary.requests, 4);
        assert_eq!(summary.successes, 3);
        assert_eq!(summary.failures, 1);
        assert!((summary.success_ratio - 0.75).abs() < f64::EPSILON);
        assert!((summary.throughput_rps - 2.0).abs() < f64::EPSILON);
        assert_eq!(summary.auth.attempts, 1);
        assert!((summary.auth.mean_latency_ms - 8.0).abs() < 1e-9);
        assert_eq!(summary.tasks.len(), 2);
        assert_eq!(summary.tasks[0].name, "create");
        assert_eq!(summary.tasks[0].business_rejections, 1);
        assert!((summary.tasks[1].mean_latency_ms - 15.0).abs() < 1e-9);
    }

    #[test]
    fn latency_stats_are_in_milliseconds() {
        let latency = RunSummary::new(&stats(), Duration::from_secs(1)).latency;
        assert_eq!(latency.count, 4);
        assert!((latency.min - 10.0).abs() < 0.1);
        assert!((latency.max - 40.0).abs() < 0.1);
        assert!((latency.mean - 25.0).abs() < 0.1);
    }

    #[test]
    fn empty_run_has_zeroed_summary() {
        let summary = RunSummary::new(&RunStats::new(), Duration::ZERO);
        assert_eq!(summary.latency, LatencyStats::default());
        assert_eq!(summary.throughput_rps, 0.0);
        assert_eq!(summary.success_ratio, 0.0);
        assert!(summary.to_string().contains("0 requests"));
    }

    #[test]
    fn outcome_summary_carries_population() {
        let tick = TickRecord {
            elapsed: Duration::from_secs(1),
            target: 10,
            live: 10,
            spawned: 5,
            retired: 0,
            retiring: 0,
        };
        let outcome = RunOutcome {
            stats: stats(),
            timeline: vec![TickRecord { live: 5, ..tick }, tick],
            elapsed: Duration::from_secs(2),
            peak_users: 10,
            spawned_users: 10,
            abandoned_users: 1,
            panicked_users: 0,
        };

        let summary = RunSummary::from(&outcome);

        assert_eq!(summary.peak_users, 10);
        assert_eq!(summary.live_users, 10);
        assert_eq!(summary.timeline.len(), 2);
        assert_eq!(summary.timeline[0].live, 5);
        assert!(summary.to_string().contains("abandoned"));
    }

    #[tokio::test]
    async fn json_reporter_writes_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let summary = RunSummary::new(&stats(), Duration::from_secs(2));

        JsonFileReporter::new(&path).report(&summary).await.unwrap();

        let written: RunSummary =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, summary);
    }

    #[tokio::test]
    async fn json_reporter_surfaces_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JsonFileReporter::new(dir.path().join("missing").join("report.json"));
        let err = reporter.report(&RunSummary::default()).await.unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_reporter_stops_on_cancel() {
        let (_tx, rx) = watch::channel(TickRecord::default());
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(periodic_reporter(
            MetricsSink::with_shards(1),
            rx,
            Duration::from_secs(1),
            true,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        reporter.await.unwrap();
    }
}
