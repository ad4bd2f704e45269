use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Job;
use crate::operation::{Operation, OperationFactory, WorkItem};
use crate::rate_limiter::RateLimiter;
use crate::stats::{ErrorKind, Outcome, ResultAggregator};

/// Defines how a single job is run.
pub struct RunConfiguration {
    /// The maximum duration of the job. If `None`, it is unlimited.
    pub max_duration: Option<Duration>,

    /// The exact number of operations to attempt. If `None`, it is unlimited.
    pub max_operations: Option<u64>,

    /// The number of workers. Each worker is a tokio task which
    /// sequentially performs operations. Must not be zero.
    pub concurrency: u64,

    /// The maximum number of operations to be started per second.
    /// If `None`, then there is no rate limit imposed.
    pub rate_limit_per_second: Option<f64>,

    /// Deadline for a single operation.
    pub operation_timeout: Duration,

    pub operation_factory: Arc<dyn OperationFactory>,

    pub aggregator: Arc<ResultAggregator>,
}

impl RunConfiguration {
    pub fn from_job(
        job: &Job,
        operation_factory: Arc<dyn OperationFactory>,
        aggregator: Arc<ResultAggregator>,
    ) -> Self {
        Self {
            max_duration: job.max_duration(),
            max_operations: job.max_operations(),
            concurrency: job.connections,
            rate_limit_per_second: job.rate_limit_per_second(),
            operation_timeout: job.timeout,
            operation_factory,
            aggregator,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Idle,
            1 => JobState::Running,
            2 => JobState::Completed,
            3 => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

/// How a job ended, if it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Cancelled,
}

// State shared by the dispatcher, the workers and the controller.
struct RunContext {
    state: AtomicU8,

    // Fires when the job enters a terminal state. Nothing new is started
    // after that, operations in flight are allowed to finish.
    stop: CancellationToken,
    // Fires when in-flight operations should be abandoned as well.
    abort: CancellationToken,

    fatal_error: Mutex<Option<anyhow::Error>>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(JobState::Idle as u8),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            fatal_error: Mutex::new(None),
        }
    }

    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // Moves the job from Running into a terminal state. Only the first
    // terminal transition takes effect.
    fn finish(&self, state: JobState) -> bool {
        let finished =
            self.transition(JobState::Running, state) || self.transition(JobState::Idle, state);
        self.stop.cancel();
        finished
    }

    fn fail(&self, err: anyhow::Error) {
        let mut fatal_error = self.fatal_error.lock();
        if fatal_error.is_none() {
            *fatal_error = Some(err);
        }
        drop(fatal_error);
        self.finish(JobState::Failed);
    }
}

/// Allows to control the job while it runs.
pub struct RunController {
    ctx: Arc<RunContext>,
}

impl RunController {
    /// Stops admitting new operations. Operations in flight are allowed to
    /// finish within their timeout, after which the job reports `Cancelled`.
    pub fn ask_to_stop(&self) {
        if self.ctx.finish(JobState::Cancelled) {
            tracing::info!("job asked to stop");
        }
    }

    /// Like [`RunController::ask_to_stop`], but also abandons operations
    /// which are still in flight.
    pub fn abort(&self) {
        self.ask_to_stop();
        self.ctx.abort.cancel();
    }

    pub fn state(&self) -> JobState {
        self.ctx.state()
    }
}

/// Prepares a job to be run.
///
/// Nothing happens until the returned future is polled. The future resolves
/// once the job reached a terminal state and all of its workers exited.
/// A job which ends in the `Failed` state resolves to an error.
pub fn run(config: RunConfiguration) -> (RunController, impl Future<Output = Result<Termination>>) {
    let ctx = Arc::new(RunContext::new());
    let controller = RunController {
        ctx: Arc::clone(&ctx),
    };
    (controller, do_run(config, ctx))
}

async fn do_run(config: RunConfiguration, ctx: Arc<RunContext>) -> Result<Termination> {
    if let Err(err) = config.operation_factory.prepare().await {
        ctx.fail(err);
        return conclude(&ctx);
    }
    if !ctx.transition(JobState::Idle, JobState::Running) {
        // Cancelled before it got a chance to start
        return conclude(&ctx);
    }

    let start_time = Instant::now();
    let concurrency = config.concurrency.max(1);
    // Shared by the workers, which take a token right before they start
    // an operation. Items waiting in the queue hold no tokens.
    let rate_limiter = config
        .rate_limit_per_second
        .map(|rate| Arc::new(RateLimiter::new(start_time, rate)));

    // The queue holds at most one item per worker. The dispatcher waits
    // when it is full.
    let (tx, rx) = mpsc::channel(concurrency as usize);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let dispatcher = Dispatcher {
        ctx: Arc::clone(&ctx),
        max_operations: config.max_operations,
        tx,
    };
    let (fut, _dispatcher_handle) = dispatcher.run().remote_handle();
    tokio::task::spawn(fut);

    // Spawn as many worker tasks as the concurrency allows
    let mut worker_handles = (0..concurrency)
        .map(|_| {
            let worker = Worker {
                ctx: Arc::clone(&ctx),
                queue: Arc::clone(&rx),
                rate_limiter: rate_limiter.clone(),
                timeout: config.operation_timeout,
                aggregator: Arc::clone(&config.aggregator),
            };
            let operation = config.operation_factory.create();
            let (fut, handle) = worker.run(operation).remote_handle();
            tokio::task::spawn(fut);
            handle
        })
        .collect::<FuturesUnordered<_>>();

    // If there is a time limit, spawn a task which will stop the job
    // after the period has elapsed
    let ctx_clone = Arc::clone(&ctx);
    let _stopper_handle = config.max_duration.map(move |duration| {
        let (fut, handle) = async move {
            tokio::time::sleep_until(start_time + duration).await;
            if ctx_clone.finish(JobState::Completed) {
                tracing::debug!("job reached its duration");
            }
        }
        .remote_handle();
        tokio::task::spawn(fut);
        handle
    });

    while worker_handles.next().await.is_some() {}

    // All workers are done, so the dispatcher has either run out of
    // operations or observed the stop signal.
    if ctx.finish(JobState::Completed) {
        tracing::debug!("job ran out of operations");
    }
    conclude(&ctx)
}

fn conclude(ctx: &RunContext) -> Result<Termination> {
    match ctx.state() {
        JobState::Cancelled => Ok(Termination::Cancelled),
        JobState::Failed => Err(ctx
            .fatal_error
            .lock()
            .take()
            .unwrap_or_else(|| anyhow::anyhow!("job failed"))),
        _ => Ok(Termination::Completed),
    }
}

// Issues sequence numbers into the queue until the operation budget
// is used up.
struct Dispatcher {
    ctx: Arc<RunContext>,
    max_operations: Option<u64>,
    tx: mpsc::Sender<WorkItem>,
}

impl Dispatcher {
    async fn run(self) {
        let mut seq = 0u64;
        while self.max_operations.map_or(true, |max| seq < max) {
            let item = WorkItem {
                seq,
                scheduled_start_time: Instant::now(),
            };
            tokio::select! {
                biased;
                _ = self.ctx.stop.cancelled() => break,
                sent = self.tx.send(item) => {
                    if sent.is_err() {
                        // All workers are gone
                        break;
                    }
                }
            }
            seq += 1;
        }
        tracing::debug!(dispatched = seq, "dispatcher finished");
        // Dropping the sender closes the queue, which lets idle workers exit
    }
}

struct Worker {
    ctx: Arc<RunContext>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    timeout: Duration,
    aggregator: Arc<ResultAggregator>,
}

impl Worker {
    // Pulls items from the queue until it is closed or the job stops.
    async fn run(self, mut operation: Box<dyn Operation>) {
        loop {
            let admitted_at = match &self.rate_limiter {
                Some(rate_limiter) => match rate_limiter.acquire(&self.ctx.stop).await {
                    Some(start_time) => Some(start_time),
                    None => return,
                },
                None => None,
            };

            let item = {
                // The mutex hands out the receiver in FIFO order
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.ctx.stop.cancelled() => None,
                    item = queue.recv() => item,
                }
            };
            let Some(mut item) = item else {
                return;
            };
            if self.ctx.stop.is_cancelled() {
                return;
            }
            if let Some(admitted_at) = admitted_at {
                item.scheduled_start_time = admitted_at;
            }

            let actual_start_time = Instant::now();
            let mut fatal_error = None;
            let result = tokio::select! {
                biased;
                _ = self.ctx.abort.cancelled() => Err(ErrorKind::Aborted),
                result = tokio::time::timeout(self.timeout, operation.execute(&item)) => {
                    match result {
                        Ok(Ok(records)) => Ok(records),
                        Ok(Err(err)) if err.is_fatal() => {
                            fatal_error = Some(err);
                            Err(ErrorKind::Unavailable)
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(seq = item.seq, error = %err, "operation failed");
                            Err(ErrorKind::Operation)
                        }
                        Err(_) => {
                            tracing::warn!(seq = item.seq, timeout = ?self.timeout, "operation timed out");
                            Err(ErrorKind::Timeout)
                        }
                    }
                }
            };
            let now = Instant::now();

            let outcome = Outcome {
                seq: item.seq,
                result,
                service_time: now - actual_start_time,
                response_time: now.saturating_duration_since(item.scheduled_start_time),
            };
            self.aggregator.record(&outcome);

            // A single failed operation is only counted, but an unavailable
            // backend fails the whole job
            if let Some(err) = fatal_error {
                tracing::error!(seq = item.seq, error = %err, "backend unavailable, failing the job");
                self.ctx.fail(anyhow::Error::new(err).context(format!(
                    "Backend became unavailable during operation {}",
                    item.seq
                )));
                return;
            }
            if outcome.result == Err(ErrorKind::Aborted) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::backend::BackendError;
    use crate::test_util::fn_operation_factory;

    fn make_test_cfg(operation_factory: Arc<dyn OperationFactory>) -> RunConfiguration {
        RunConfiguration {
            max_duration: None,
            max_operations: None,
            concurrency: 10,
            rate_limit_per_second: None,
            operation_timeout: Duration::from_secs(5),
            operation_factory,
            aggregator: Arc::new(ResultAggregator::new()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_to_operation_budget() {
        for concurrency in [1, 8, 64] {
            let executed = Arc::new(AtomicU64::new(0));
            let seq_sum = Arc::new(AtomicU64::new(0));

            let (executed_clone, seq_sum_clone) = (executed.clone(), seq_sum.clone());
            let factory = fn_operation_factory(move |seq| {
                executed_clone.fetch_add(1, Ordering::SeqCst);
                seq_sum_clone.fetch_add(seq, Ordering::SeqCst);
                async { Ok::<_, BackendError>(1) }
            });

            let mut cfg = make_test_cfg(factory);
            cfg.concurrency = concurrency;
            cfg.max_operations = Some(1000);
            let aggregator = cfg.aggregator.clone();

            let (ctrl, fut) = run(cfg);
            assert_eq!(fut.await.unwrap(), Termination::Completed);
            assert_eq!(ctrl.state(), JobState::Completed);

            // Every sequence number from 0 to 999 was executed exactly once
            assert_eq!(executed.load(Ordering::SeqCst), 1000);
            assert_eq!(seq_sum.load(Ordering::SeqCst), 499500);

            let stats = aggregator.finish();
            assert_eq!(stats.attempted, 1000);
            assert_eq!(stats.succeeded, 1000);
            assert_eq!(stats.failed, 0);
        }
    }

    #[tokio::test]
    async fn test_run_to_max_duration() {
        let factory = fn_operation_factory(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, BackendError>(1)
        });

        let mut cfg = make_test_cfg(factory);
        cfg.max_duration = Some(Duration::from_millis(200));
        cfg.operation_timeout = Duration::from_secs(1);

        let start = Instant::now();
        let (_ctrl, fut) = run(cfg);
        assert_eq!(fut.await.unwrap(), Termination::Completed);
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_duration_and_budget_first_wins() {
        let factory = fn_operation_factory(|_| async { Ok::<_, BackendError>(1) });

        let mut cfg = make_test_cfg(factory);
        cfg.max_duration = Some(Duration::from_secs(30));
        cfg.max_operations = Some(50);
        let aggregator = cfg.aggregator.clone();

        let start = Instant::now();
        let (_ctrl, fut) = run(cfg);
        assert_eq!(fut.await.unwrap(), Termination::Completed);
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(aggregator.finish().attempted, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rate_limited_run() {
        let factory = fn_operation_factory(|_| async { Ok::<_, BackendError>(1) });

        let mut cfg = make_test_cfg(factory);
        cfg.concurrency = 2;
        cfg.max_duration = Some(Duration::from_secs(1));
        cfg.rate_limit_per_second = Some(10.0);
        let aggregator = cfg.aggregator.clone();

        let (_ctrl, fut) = run(cfg);
        fut.await.unwrap();

        let attempted = aggregator.finish().attempted;
        assert!((9..=11).contains(&attempted), "attempted {attempted}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pace_holds_after_workers_stall() {
        // The first round of operations hangs long enough for the bucket to
        // fill up and for the queue to fill with waiting items. Once the
        // workers are free, no window may see more than pace + burst starts.
        let pace = 10;
        let concurrency = 8;
        let starts = Arc::new(Mutex::new(Vec::new()));
        let starts_clone = starts.clone();
        let factory = fn_operation_factory(move |seq| {
            starts_clone.lock().push(Instant::now());
            async move {
                if seq < concurrency {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                Ok::<_, BackendError>(1)
            }
        });

        let mut cfg = make_test_cfg(factory);
        cfg.concurrency = concurrency;
        cfg.max_duration = Some(Duration::from_millis(4500));
        cfg.rate_limit_per_second = Some(pace as f64);
        cfg.operation_timeout = Duration::from_secs(10);

        let (_ctrl, fut) = run(cfg);
        assert_eq!(fut.await.unwrap(), Termination::Completed);

        let mut starts = starts.lock().clone();
        starts.sort();
        let window = Duration::from_secs(1);
        let max_in_window = (0..starts.len())
            .map(|i| {
                starts[i..]
                    .iter()
                    .take_while(|start| **start < starts[i] + window)
                    .count()
            })
            .max()
            .unwrap_or(0);
        assert!(
            max_in_window <= 2 * pace as usize,
            "{max_in_window} starts within one second out of {}",
            starts.len()
        );
    }

    #[tokio::test]
    async fn test_operation_errors_are_counted() {
        let factory = fn_operation_factory(|seq| async move {
            if seq % 2 == 0 {
                Err(BackendError::operation("duplicate key"))
            } else {
                Ok(1)
            }
        });

        let mut cfg = make_test_cfg(factory);
        cfg.max_operations = Some(100);
        let aggregator = cfg.aggregator.clone();

        let (_ctrl, fut) = run(cfg);
        assert_eq!(fut.await.unwrap(), Termination::Completed);

        let stats = aggregator.finish();
        assert_eq!(stats.attempted, 100);
        assert_eq!(stats.succeeded, 50);
        assert_eq!(stats.failed, 50);
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let factory = fn_operation_factory(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BackendError>(1)
        });

        let mut cfg = make_test_cfg(factory);
        cfg.concurrency = 5;
        cfg.max_operations = Some(5);
        cfg.operation_timeout = Duration::from_millis(10);
        let aggregator = cfg.aggregator.clone();

        let (_ctrl, fut) = run(cfg);
        assert_eq!(fut.await.unwrap(), Termination::Completed);

        let stats = aggregator.finish();
        assert_eq!(stats.attempted, 5);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.timeouts, 5);
    }

    #[tokio::test]
    async fn test_run_to_fatal_error() {
        let factory = fn_operation_factory(|seq| async move {
            if seq >= 500 {
                return Err(BackendError::unavailable("connection refused"));
            }
            Ok(1)
        });

        let mut cfg = make_test_cfg(factory);
        cfg.max_operations = Some(10_000);
        let aggregator = cfg.aggregator.clone();

        let (ctrl, fut) = run(cfg);
        let err = fut.await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"), "{err:#}");
        assert_eq!(ctrl.state(), JobState::Failed);

        let stats = aggregator.finish();
        assert_eq!(stats.succeeded, 500);
        assert!(stats.attempted < 10_000);
    }

    #[tokio::test]
    async fn test_cancellation_admits_nothing_new() {
        let executed = Arc::new(AtomicU64::new(0));
        let executed_clone = executed.clone();
        let factory = fn_operation_factory(move |_| {
            executed_clone.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, BackendError>(1)
            }
        });

        let mut cfg = make_test_cfg(factory);
        cfg.max_duration = Some(Duration::from_secs(60));
        let aggregator = cfg.aggregator.clone();

        let (ctrl, fut) = run(cfg);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctrl.ask_to_stop();
        assert_eq!(ctrl.state(), JobState::Cancelled);

        assert_eq!(handle.await.unwrap().unwrap(), Termination::Cancelled);

        // In-flight operations finished and were recorded, nothing
        // was started afterwards
        let after_stop = executed.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executed.load(Ordering::SeqCst), after_stop);

        let stats = aggregator.finish();
        assert_eq!(stats.attempted, after_stop);
        assert_eq!(stats.succeeded, after_stop);
    }

    #[tokio::test]
    async fn test_abort_abandons_in_flight_operations() {
        let factory = fn_operation_factory(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, BackendError>(1)
        });

        let mut cfg = make_test_cfg(factory);
        cfg.concurrency = 4;
        cfg.max_operations = Some(100);
        cfg.operation_timeout = Duration::from_secs(60);
        let aggregator = cfg.aggregator.clone();

        let (ctrl, fut) = run(cfg);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.abort();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), Termination::Cancelled);

        let stats = aggregator.finish();
        assert_eq!(stats.attempted, 4);
        assert_eq!(stats.failed, 4);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let executed = Arc::new(AtomicU64::new(0));
        let executed_clone = executed.clone();
        let factory = fn_operation_factory(move |_| {
            executed_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BackendError>(1) }
        });

        let mut cfg = make_test_cfg(factory);
        cfg.max_operations = Some(10);

        let (ctrl, fut) = run(cfg);
        assert_eq!(ctrl.state(), JobState::Idle);
        ctrl.ask_to_stop();
        assert_eq!(fut.await.unwrap(), Termination::Cancelled);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prepare_failure_fails_the_job() {
        struct Unreachable;

        #[async_trait]
        impl OperationFactory for Unreachable {
            async fn prepare(&self) -> Result<()> {
                Err(anyhow::anyhow!("no reachable servers"))
            }

            fn create(&self) -> Box<dyn Operation> {
                unreachable!("no operation should be created")
            }
        }

        let mut cfg = make_test_cfg(Arc::new(Unreachable));
        cfg.max_operations = Some(10);

        let (ctrl, fut) = run(cfg);
        fut.await.unwrap_err();
        assert_eq!(ctrl.state(), JobState::Failed);
    }
}
