pub mod memory;

use futures::stream::BoxStream;
use snafu::Snafu;

/// A document, independent of the store it is written to.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A lazily produced, finite sequence of records returned by a read.
/// It cannot be restarted: reading again means issuing another `find`.
pub type RecordStream = BoxStream<'static, Result<Record, BackendError>>;

#[derive(Debug, Snafu)]
pub enum BackendError {
    /// A single operation failed. The store is still considered usable.
    #[snafu(display("operation failed: {message}"))]
    Operation { message: String },

    /// The store cannot be reached at all.
    #[snafu(display("backend unavailable: {message}"))]
    Unavailable { message: String },
}

impl BackendError {
    pub fn operation(message: impl Into<String>) -> Self {
        BackendError::Operation {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            message: message.into(),
        }
    }

    /// Whether the error should stop the whole job rather than being
    /// counted as a failed operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

/// The operations the load generator needs from a data store.
///
/// A single instance is shared by all workers of all jobs, so
/// implementations must be safe to use concurrently. Connection pooling,
/// if any, is the implementation's business.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Checks that the store can be reached.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn insert_one(&self, record: &Record) -> Result<(), BackendError>;

    async fn insert_many(&self, records: &[Record]) -> Result<(), BackendError>;

    /// Starts a read of all records matching `filter`. `batch_size` is a hint
    /// for how many records the store should return per round trip;
    /// 0 leaves it up to the store.
    async fn find(&self, filter: &Record, batch_size: u32) -> Result<RecordStream, BackendError>;
}
