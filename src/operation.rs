use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;

use crate::backend::{Backend, BackendError, Record};
use crate::config::{Job, Mode};

/// A single unit of dispatched work.
pub struct WorkItem {
    /// Sequence number of the item within its job.
    ///
    /// Items are issued with increasing numbers, but because several
    /// workers run in parallel they can complete in any order.
    pub seq: u64,

    /// The time at which the rate limiter allowed the operation to start.
    /// Differs from the time it actually started when workers are saturated.
    pub scheduled_start_time: Instant,
}

/// Represents an operation which is repeatedly performed by one worker.
#[async_trait]
pub trait Operation: Send {
    /// Performs the operation once and returns how many records were written
    /// or read.
    async fn execute(&mut self, item: &WorkItem) -> Result<u64, BackendError>;
}

/// Creates one [`Operation`] per worker.
#[async_trait]
pub trait OperationFactory: Send + Sync {
    /// Called once before any worker starts. An error fails the job.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn create(&self) -> Box<dyn Operation>;
}

/// What a job does on every operation.
#[derive(Clone, Debug)]
pub enum Workload {
    InsertOne { record: Record },
    InsertMany { records: Vec<Record> },
    Find { filter: Record, batch_size: u32 },
}

impl Workload {
    pub fn for_job(job: &Job) -> Self {
        match job.mode {
            Mode::Write => {
                let record = job.template.clone().unwrap_or_else(default_template);
                if job.batch_size <= 1 {
                    Workload::InsertOne { record }
                } else {
                    let records = vec![record; job.batch_size as usize];
                    Workload::InsertMany { records }
                }
            }
            Mode::Read => Workload::Find {
                filter: job.filter.clone().unwrap_or_default(),
                batch_size: job.batch_size.min(u32::MAX as u64) as u32,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Workload::InsertOne { .. } => "insert one".to_string(),
            Workload::InsertMany { records } => format!("insert many ({})", records.len()),
            Workload::Find { batch_size, .. } => format!("find (batch size {batch_size})"),
        }
    }
}

fn default_template() -> Record {
    let value = json!({
        "title": "The Trial",
        "author": "Franz Kafka",
        "isbn": "978-0307595119",
    });
    match value {
        serde_json::Value::Object(record) => record,
        _ => Record::new(),
    }
}

pub struct BackendOperationFactory {
    backend: Arc<dyn Backend>,
    workload: Arc<Workload>,
}

impl BackendOperationFactory {
    pub fn new(backend: Arc<dyn Backend>, workload: Workload) -> Self {
        Self {
            backend,
            workload: Arc::new(workload),
        }
    }
}

#[async_trait]
impl OperationFactory for BackendOperationFactory {
    async fn prepare(&self) -> Result<()> {
        self.backend
            .ping()
            .await
            .context("Failed to reach the backend")
    }

    fn create(&self) -> Box<dyn Operation> {
        Box::new(BackendOperation {
            backend: Arc::clone(&self.backend),
            workload: Arc::clone(&self.workload),
        })
    }
}

struct BackendOperation {
    backend: Arc<dyn Backend>,
    workload: Arc<Workload>,
}

#[async_trait]
impl Operation for BackendOperation {
    async fn execute(&mut self, _item: &WorkItem) -> Result<u64, BackendError> {
        match &*self.workload {
            Workload::InsertOne { record } => {
                self.backend.insert_one(record).await?;
                Ok(1)
            }
            Workload::InsertMany { records } => {
                self.backend.insert_many(records).await?;
                Ok(records.len() as u64)
            }
            Workload::Find { filter, batch_size } => {
                let mut stream = self.backend.find(filter, *batch_size).await?;
                let mut found = 0;
                while let Some(record) = stream.next().await {
                    record?;
                    found += 1;
                }
                Ok(found)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn item() -> WorkItem {
        WorkItem {
            seq: 0,
            scheduled_start_time: Instant::now(),
        }
    }

    #[test]
    fn test_workload_selection() {
        let mut job = Job::default();
        assert!(matches!(Workload::for_job(&job), Workload::InsertOne { .. }));

        job.batch_size = 1;
        assert!(matches!(Workload::for_job(&job), Workload::InsertOne { .. }));

        job.batch_size = 10;
        match Workload::for_job(&job) {
            Workload::InsertMany { records } => assert_eq!(records.len(), 10),
            other => panic!("unexpected workload: {other:?}"),
        }

        job.mode = Mode::Read;
        match Workload::for_job(&job) {
            Workload::Find { filter, batch_size } => {
                assert!(filter.is_empty());
                assert_eq!(batch_size, 10);
            }
            other => panic!("unexpected workload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_operations() {
        let backend = Arc::new(MemoryBackend::new());

        let job = Job {
            batch_size: 5,
            ..Default::default()
        };
        let factory = BackendOperationFactory::new(backend.clone(), Workload::for_job(&job));
        factory.prepare().await.unwrap();
        let mut op = factory.create();
        assert_eq!(op.execute(&item()).await.unwrap(), 5);
        assert_eq!(op.execute(&item()).await.unwrap(), 5);
        assert_eq!(backend.len(), 10);

        let job = Job {
            mode: Mode::Read,
            ..Default::default()
        };
        let factory = BackendOperationFactory::new(backend.clone(), Workload::for_job(&job));
        let mut op = factory.create();
        assert_eq!(op.execute(&item()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_prepare_fails_when_unreachable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unreachable(true);
        let factory = BackendOperationFactory::new(backend, Workload::for_job(&Job::default()));
        assert!(factory.prepare().await.is_err());
    }
}
