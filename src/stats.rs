use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::run::JobState;

const HISTOGRAM_PRECISION: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backend reported a failure of this operation.
    Operation,
    /// The operation did not finish within the job's timeout.
    Timeout,
    /// The backend could not be reached.
    Unavailable,
    /// The operation was abandoned because the run was aborted.
    Aborted,
}

/// The result of executing one work item.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub seq: u64,
    /// Number of records written or read, or the reason of the failure.
    pub result: Result<u64, ErrorKind>,
    /// Time between the actual start of the operation and its completion.
    pub service_time: Duration,
    /// Time between the scheduled start of the operation and its completion.
    /// Includes the time the item spent waiting for a free worker.
    pub response_time: Duration,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone)]
pub struct Stats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub records: u64,
    pub total_latency: Duration,

    // Latency in microseconds, measured both with and without
    // the coordinated omission fix
    pub raw: Histogram<u64>,
    pub co_fixed: Histogram<u64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            attempted: 0,
            succeeded: 0,
            failed: 0,
            timeouts: 0,
            records: 0,
            total_latency: Duration::ZERO,
            // This cannot panic since 1 <= sigfig <= 5.
            raw: Histogram::new(HISTOGRAM_PRECISION).unwrap(),
            co_fixed: Histogram::new(HISTOGRAM_PRECISION).unwrap(),
        }
    }

    pub fn account(&mut self, outcome: &Outcome) {
        self.attempted += 1;
        match outcome.result {
            Ok(records) => {
                self.succeeded += 1;
                self.records += records;
            }
            Err(kind) => {
                self.failed += 1;
                if kind == ErrorKind::Timeout {
                    self.timeouts += 1;
                }
            }
        }
        self.total_latency += outcome.service_time;
        self.raw.saturating_record(outcome.service_time.as_micros() as u64);
        self.co_fixed
            .saturating_record(outcome.response_time.as_micros() as u64);
    }

    pub fn clear(&mut self) {
        self.attempted = 0;
        self.succeeded = 0;
        self.failed = 0;
        self.timeouts = 0;
        self.records = 0;
        self.total_latency = Duration::ZERO;
        self.raw.reset();
        self.co_fixed.reset();
    }

    pub fn combine(&mut self, other: &Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.timeouts += other.timeouts;
        self.records += other.records;
        self.total_latency += other.total_latency;
        // Both histograms auto-resize, adding cannot go out of bounds
        let _ = self.raw.add(&other.raw);
        let _ = self.co_fixed.add(&other.co_fixed);
    }

    pub fn mean_latency(&self) -> Duration {
        if self.attempted == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total_latency.as_nanos() / self.attempted as u128) as u64)
    }

    pub fn latency_summary(&self, typ: LatencyType) -> LatencySummary {
        let histogram = match typ {
            LatencyType::Raw => &self.raw,
            LatencyType::AdjustedForCoordinatedOmission => &self.co_fixed,
        };
        let at = |q: f64| Duration::from_micros(histogram.value_at_quantile(q));
        LatencySummary {
            mean: Duration::from_micros(histogram.mean() as u64),
            p50: at(0.5),
            p90: at(0.9),
            p99: at(0.99),
            p999: at(0.999),
            max: Duration::from_micros(histogram.max()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum LatencyType {
    Raw,
    AdjustedForCoordinatedOmission,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub p999: Duration,
    pub max: Duration,
}

/// Collects outcomes reported concurrently by the workers of one job.
///
/// Each thread accounts outcomes into its own shard, protected by a separate
/// parking_lot::Mutex. Shards are only contended when somebody reads the
/// statistics, which happens rarely (once per progress tick).
///
/// Reading drains the shards into a running total, so interval reads for
/// progress reporting never lose anything from the final result.
pub struct ResultAggregator {
    shards: ThreadLocal<Arc<Mutex<Stats>>>,
    all: Mutex<Vec<Arc<Mutex<Stats>>>>,
    total: Mutex<Stats>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            shards: ThreadLocal::new(),
            all: Mutex::new(Vec::new()),
            total: Mutex::new(Stats::new()),
        }
    }

    pub fn record(&self, outcome: &Outcome) {
        self.shards
            .get_or(|| {
                let shard = Arc::new(Mutex::new(Stats::new()));
                self.all.lock().push(shard.clone());
                shard
            })
            .lock()
            .account(outcome);
    }

    /// Returns the statistics accounted since the previous call.
    ///
    /// Meant for live progress. The authoritative result is the one
    /// returned by [`ResultAggregator::finish`].
    pub fn take_interval(&self) -> Stats {
        let mut interval = Stats::new();
        for shard in self.all.lock().iter() {
            let shard = &mut shard.lock();
            interval.combine(shard);
            shard.clear();
        }
        self.total.lock().combine(&interval);
        interval
    }

    /// Returns everything recorded since the aggregator was created.
    pub fn finish(&self) -> Stats {
        self.take_interval();
        self.total.lock().clone()
    }
}

/// Final statistics of one job.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub name: String,
    pub state: JobState,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub records: u64,
    pub elapsed: Duration,
    pub latency: LatencySummary,
    pub co_fixed_latency: LatencySummary,
}

impl RunReport {
    pub fn new(name: String, state: JobState, stats: &Stats, elapsed: Duration) -> Self {
        Self {
            name,
            state,
            attempted: stats.attempted,
            succeeded: stats.succeeded,
            failed: stats.failed,
            timeouts: stats.timeouts,
            records: stats.records,
            elapsed,
            latency: stats.latency_summary(LatencyType::Raw),
            co_fixed_latency: stats.latency_summary(LatencyType::AdjustedForCoordinatedOmission),
        }
    }

    /// Attempted operations per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.attempted as f64 / secs
    }

    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.records as f64 / secs
    }
}
