//! Processor boundary: the user code a worker runs for each job.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessorError, QueueResult};
use crate::jobs::{Job, JobId};
use crate::store::AtomicStore;

/// Runs one job and returns its result value.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError>;
}

/// Handle given to a processor while it runs one job.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// Attempts made before this one
    pub attempts_made: u32,
    store: Arc<dyn AtomicStore>,
    discarded: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        store: Arc<dyn AtomicStore>,
        job: &Job,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            attempts_made: job.attempts_made,
            store,
            discarded: Arc::new(AtomicBool::new(false)),
            cancellation_token,
        }
    }

    /// Stores a progress value and emits a `progress` event.
    pub async fn update_progress(&self, progress: JsonValue) -> QueueResult<()> {
        Ok(self.store.update_progress(&self.job_id, &progress).await?)
    }

    /// Appends a line to the job's log.
    pub async fn log(&self, line: impl AsRef<str>) -> QueueResult<u64> {
        Ok(self.store.add_log(&self.job_id, line.as_ref()).await?)
    }

    /// Fails the job on its next error without using the remaining attempts.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Cancelled when the worker gives up on the job (lost lease or forced close).
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

/// Adapts an async closure into a [`Processor`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, ProcessorError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, ProcessorError>> + Send,
{
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        (self.f)(job.clone(), ctx.clone()).await
    }
}

/// Shorthand for `Arc::new(FnProcessor::new(f))`.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, ProcessorError>> + Send + 'static,
{
    Arc::new(FnProcessor::new(f))
}
