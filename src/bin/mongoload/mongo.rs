use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Collection, Database};

use mongoload::backend::{Backend, BackendError, Record, RecordStream};
use mongoload::config::Config;

const APP_NAME: &str = "mongoload";

// Each worker holds at most one connection at a time, the extra room
// covers cursors kept open by reads.
const POOL_SIZE_PER_CONNECTION: u32 = 8;
const MAX_CONNECTING: u32 = 100;
const MAX_IDLE_TIME: Duration = Duration::from_millis(100);

// After this many connection failures in a row the deployment is
// considered gone, even if server selection still succeeds.
const MAX_CONSECUTIVE_CONNECTION_ERRORS: u64 = 10;

/// Talks to a MongoDB deployment through the official driver.
///
/// The driver keeps its own connection pool which is shared by every
/// worker of every job.
pub struct MongoBackend {
    database: Database,
    collection: Collection<Document>,
    health: ConnectionHealth,
}

impl MongoBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.connection_string)
            .await
            .context("Failed to parse the connection string")?;

        let connections: u64 = config.jobs.iter().map(|job| job.connections).sum();
        let pool_size = connections
            .saturating_mul(POOL_SIZE_PER_CONNECTION as u64)
            .min(u32::MAX as u64) as u32;

        options.app_name = Some(APP_NAME.to_string());
        options.max_pool_size = Some(pool_size);
        options.max_connecting = Some(MAX_CONNECTING);
        options.max_idle_time = Some(MAX_IDLE_TIME);
        // Server selection has to give up before any operation times out,
        // otherwise an outage would only ever be counted as timeouts.
        options.server_selection_timeout = server_selection_timeout(config);

        tracing::debug!(pool_size, "connecting to MongoDB");
        let client = Client::with_options(options).context("Failed to create the client")?;
        let database = client.database(&config.database);
        let collection = database.collection::<Document>(&config.collection);

        Ok(Self {
            database,
            collection,
            health: ConnectionHealth::default(),
        })
    }

    fn check<T>(&self, result: mongodb::error::Result<T>) -> Result<T, BackendError> {
        match result {
            Ok(value) => {
                self.health.succeeded();
                Ok(value)
            }
            Err(err) => Err(self.health.failed(classify(&err), err.to_string())),
        }
    }
}

/// Half of the shortest operation timeout.
fn server_selection_timeout(config: &Config) -> Option<Duration> {
    config.jobs.iter().map(|job| job.timeout / 2).min()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Failure {
    /// No server could be selected.
    Unreachable,
    /// A connection broke or could not be established.
    Connection,
    /// The server rejected the operation.
    Operation,
}

fn classify(err: &mongodb::error::Error) -> Failure {
    match *err.kind {
        ErrorKind::ServerSelection { .. } => Failure::Unreachable,
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::DnsResolve { .. } => {
            Failure::Connection
        }
        _ => Failure::Operation,
    }
}

// Counts connection failures in a row, shared by all workers.
#[derive(Default)]
struct ConnectionHealth {
    consecutive_connection_errors: AtomicU64,
}

impl ConnectionHealth {
    fn succeeded(&self) {
        self.consecutive_connection_errors.store(0, Ordering::Relaxed);
    }

    fn failed(&self, failure: Failure, message: String) -> BackendError {
        match failure {
            Failure::Unreachable => BackendError::unavailable(message),
            Failure::Connection => {
                let in_a_row = self
                    .consecutive_connection_errors
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if in_a_row >= MAX_CONSECUTIVE_CONNECTION_ERRORS {
                    BackendError::unavailable(format!(
                        "{in_a_row} connection errors in a row, last one: {message}"
                    ))
                } else {
                    BackendError::operation(message)
                }
            }
            Failure::Operation => {
                // The server answered, so it is reachable
                self.succeeded();
                BackendError::operation(message)
            }
        }
    }
}

fn to_document(record: &Record) -> Result<Document, BackendError> {
    bson::to_document(record).map_err(|err| BackendError::operation(err.to_string()))
}

fn to_record(document: Document) -> Record {
    match Bson::Document(document).into_relaxed_extjson() {
        serde_json::Value::Object(record) => record,
        _ => Record::new(),
    }
}

#[async_trait]
impl Backend for MongoBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.check(self.database.run_command(doc! { "ping": 1 }, None).await)?;
        Ok(())
    }

    async fn insert_one(&self, record: &Record) -> Result<(), BackendError> {
        let document = to_document(record)?;
        self.check(self.collection.insert_one(document, None).await)?;
        Ok(())
    }

    async fn insert_many(&self, records: &[Record]) -> Result<(), BackendError> {
        let documents = records
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.check(self.collection.insert_many(documents, None).await)?;
        Ok(())
    }

    async fn find(&self, filter: &Record, batch_size: u32) -> Result<RecordStream, BackendError> {
        let filter = to_document(filter)?;
        let mut options = FindOptions::default();
        if batch_size > 0 {
            options.batch_size = Some(batch_size);
        }

        let cursor = self.check(self.collection.find(filter, options).await)?;
        // Errors while iterating are never fatal on their own, the next
        // operation will find out whether the deployment is still there.
        Ok(cursor
            .map(|document| {
                document
                    .map(to_record)
                    .map_err(|err| BackendError::operation(err.to_string()))
            })
            .boxed())
    }
}
