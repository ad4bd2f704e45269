use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::config::{Config, ValidationError};
use crate::operation::{BackendOperationFactory, Workload};
use crate::run::{self, JobState, RunConfiguration, RunController};
use crate::stats::{ResultAggregator, RunReport, Stats};

/// Process exit code when every job completed.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code when at least one job failed.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code when the configuration was rejected and nothing ran.
pub const EXIT_INVALID_CONFIG: i32 = 2;
/// Process exit code when the run was interrupted.
pub const EXIT_CANCELLED: i32 = 130;

/// Runs all jobs of a validated configuration against one backend.
pub struct Engine {
    config: Config,
    backend: Arc<dyn Backend>,
}

impl Engine {
    /// Validates the configuration. Nothing is started when it is invalid.
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts every job on its own task.
    ///
    /// Jobs are independent: they are not ordered in any way, and a job
    /// which fails does not affect the others. The returned future resolves
    /// once every job has reached a terminal state.
    pub fn start(self) -> (EngineController, impl Future<Output = EngineReport>) {
        let mut handles = Vec::with_capacity(self.config.jobs.len());
        let mut tasks = Vec::with_capacity(self.config.jobs.len());

        for (index, job) in self.config.jobs.iter().enumerate() {
            let name = job.display_name(index);
            let workload = Workload::for_job(job);
            tracing::info!(
                job = %name,
                workload = %workload.describe(),
                connections = job.connections,
                "starting job"
            );

            let aggregator = Arc::new(ResultAggregator::new());
            let factory = Arc::new(BackendOperationFactory::new(
                Arc::clone(&self.backend),
                workload,
            ));
            let (controller, fut) = run::run(RunConfiguration::from_job(
                job,
                factory,
                Arc::clone(&aggregator),
            ));

            let task = tokio::spawn(async move {
                let start = Instant::now();
                let result = fut.await;
                (result, start.elapsed())
            });
            tasks.push(task);

            handles.push(JobHandle {
                name,
                controller,
                aggregator,
            });
        }

        let finished = handles
            .iter()
            .map(|handle| (handle.name.clone(), Arc::clone(&handle.aggregator)))
            .collect::<Vec<_>>();

        let controller = EngineController { jobs: handles };
        let report = async move {
            let results = join_all(tasks).await;

            let mut report = EngineReport::default();
            for ((name, aggregator), result) in finished.into_iter().zip(results) {
                let stats = aggregator.finish();
                let (state, elapsed) = match result {
                    Ok((Ok(termination), elapsed)) => {
                        let state = match termination {
                            run::Termination::Completed => JobState::Completed,
                            run::Termination::Cancelled => JobState::Cancelled,
                        };
                        (state, elapsed)
                    }
                    Ok((Err(error), elapsed)) => {
                        tracing::error!(job = %name, error = %format!("{error:#}"), "job failed");
                        report.failures.push(JobFailure {
                            job: name.clone(),
                            error,
                        });
                        (JobState::Failed, elapsed)
                    }
                    Err(join_error) => {
                        tracing::error!(job = %name, error = %join_error, "job task panicked");
                        report.failures.push(JobFailure {
                            job: name.clone(),
                            error: anyhow::anyhow!("job task panicked: {join_error}"),
                        });
                        (JobState::Failed, Default::default())
                    }
                };
                tracing::info!(job = %name, state = ?state, attempted = stats.attempted, "job finished");
                report
                    .reports
                    .push(RunReport::new(name, state, &stats, elapsed));
            }
            report
        };

        (controller, report)
    }
}

/// Live view of one running job.
pub struct JobHandle {
    name: String,
    controller: RunController,
    aggregator: Arc<ResultAggregator>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        self.controller.state()
    }

    /// Statistics accounted since the previous call, for progress output.
    pub fn take_interval(&self) -> Stats {
        self.aggregator.take_interval()
    }
}

/// Allows to control all jobs of a started engine.
pub struct EngineController {
    jobs: Vec<JobHandle>,
}

impl EngineController {
    pub fn jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    pub fn ask_to_stop(&self) {
        for job in &self.jobs {
            job.controller.ask_to_stop();
        }
    }

    pub fn abort(&self) {
        for job in &self.jobs {
            job.controller.abort();
        }
    }
}

/// A job which ended in the `Failed` state.
#[derive(Debug)]
pub struct JobFailure {
    pub job: String,
    pub error: anyhow::Error,
}

/// Reports of all jobs, in the order in which they were configured.
#[derive(Debug, Default)]
pub struct EngineReport {
    pub reports: Vec<RunReport>,
    pub failures: Vec<JobFailure>,
}

impl EngineReport {
    pub fn exit_code(&self) -> i32 {
        let any = |state: JobState| self.reports.iter().any(|r| r.state == state);
        if !self.failures.is_empty() || any(JobState::Failed) {
            EXIT_FAILURE
        } else if any(JobState::Cancelled) {
            EXIT_CANCELLED
        } else {
            EXIT_SUCCESS
        }
    }
}
