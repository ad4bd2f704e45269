//! An in-process [`Backend`] keeping records in memory.
//!
//! Useful for dry runs of a configuration (`memory://` connection strings)
//! and for exercising the engine in tests: it can be told to respond slowly,
//! to fail every n-th operation or to be unreachable.
//!
//! Only the first [`DEFAULT_CAPACITY`] records are kept, so a long dry run
//! stays within bounded memory. Inserts past that are counted and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;

use super::{Backend, BackendError, Record, RecordStream};

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct MemoryBackend {
    records: RwLock<Vec<Record>>,
    capacity: usize,
    inserted: AtomicU64,
    latency: Option<Duration>,
    fail_every: Option<u64>,
    unreachable: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            capacity: DEFAULT_CAPACITY,
            inserted: AtomicU64::new(0),
            latency: None,
            fail_every: None,
            unreachable: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` records for `find` to return.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Every operation takes at least `latency` to complete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every `n`-th operation (counting from 1) fails with an operation error.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of insert and find calls made so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of records inserted so far, including the ones dropped
    /// past the capacity.
    pub fn len(&self) -> usize {
        self.inserted.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records actually kept.
    pub fn stored(&self) -> usize {
        self.records.read().len()
    }

    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut stored = self.records.write();
        for record in records {
            self.store(&mut stored, record);
        }
    }

    fn store(&self, stored: &mut Vec<Record>, record: Record) {
        self.inserted.fetch_add(1, Ordering::SeqCst);
        if stored.len() < self.capacity {
            stored.push(record);
        }
    }

    async fn begin_operation(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("memory backend is unreachable"));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.fail_every {
            Some(n) if call % n == 0 => Err(BackendError::operation(format!(
                "injected failure on call {call}"
            ))),
            _ => Ok(()),
        }
    }
}

fn matches(record: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .all(|(key, value)| record.get(key) == Some(value))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("memory backend is unreachable"));
        }
        Ok(())
    }

    async fn insert_one(&self, record: &Record) -> Result<(), BackendError> {
        self.begin_operation().await?;
        self.store(&mut self.records.write(), record.clone());
        Ok(())
    }

    async fn insert_many(&self, records: &[Record]) -> Result<(), BackendError> {
        self.begin_operation().await?;
        let mut stored = self.records.write();
        let room = self.capacity.saturating_sub(stored.len());
        stored.extend_from_slice(&records[..records.len().min(room)]);
        self.inserted.fetch_add(records.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn find(&self, filter: &Record, _batch_size: u32) -> Result<RecordStream, BackendError> {
        self.begin_operation().await?;
        let found = self
            .records
            .read()
            .iter()
            .filter(|record| matches(record, filter))
            .cloned()
            .collect::<Vec<_>>();
        Ok(stream::iter(found.into_iter().map(Ok)).boxed())
    }
}
