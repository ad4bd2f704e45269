use std::future::Future;
use std::sync::Arc;

use crate::backend::BackendError;
use crate::operation::{Operation, OperationFactory, WorkItem};

/// Creates a factory whose operations call `f` with the sequence number
/// of the executed work item.
pub(crate) fn fn_operation_factory<F, Fut>(f: F) -> Arc<dyn OperationFactory>
where
    F: Fn(u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, BackendError>> + Send + 'static,
{
    Arc::new(FnOperationFactory { f: Arc::new(f) })
}

struct FnOperationFactory<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F, Fut> OperationFactory for FnOperationFactory<F>
where
    F: Fn(u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, BackendError>> + Send + 'static,
{
    fn create(&self) -> Box<dyn Operation> {
        Box::new(FnOperation {
            f: Arc::clone(&self.f),
        })
    }
}

struct FnOperation<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, BackendError>> + Send + 'static,
{
    async fn execute(&mut self, item: &WorkItem) -> Result<u64, BackendError> {
        (self.f)(item.seq).await
    }
}
