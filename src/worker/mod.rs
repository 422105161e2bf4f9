//! Worker: claims jobs, runs them through a [`Processor`] and records the outcome.
//!
//! A worker keeps `concurrency` slots. Each slot claims a job, processes it and
//! keeps going with the job handed back by the finalize transaction, returning
//! to the dispatcher only once there is nothing left to claim or the worker is
//! pausing or closing. Only one slot at a time blocks on the store waiting for
//! new work.

pub mod lease;
pub mod processor;
pub mod registry;
pub mod sandbox;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::settings::WorkerConfig;
use crate::error::{ProcessorError, QueueError, QueueResult};
use crate::jobs::backoff::compute_delay;
use crate::jobs::{BackoffStrategies, BackoffStrategy, Job, JobId, NO_RETRY};
use crate::scheduler::Repeat;
use crate::store::{
    AdmitRequest, AtomicStore, AttemptRecord, DelayRequest, FinalizeRequest, LimiterSpec, Outcome,
    RequeueRequest,
};
use crate::utils::now_ms;

pub use lease::LeaseRegistry;
pub use processor::{FnProcessor, JobContext, Processor, processor_fn};
pub use registry::ProcessorRegistry;
pub use sandbox::SandboxedProcessor;

const EVENT_CAPACITY: usize = 256;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Runtime options of a [`Worker`].
#[derive(Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub lock_duration_ms: u64,
    pub lock_renew_time_ms: u64,
    /// Longest single blocking wait for new work
    pub drain_delay: Duration,
    pub limiter: Option<LimiterSpec>,
    pub backoff_strategies: BackoffStrategies,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            lock_duration_ms: config.lock_duration_ms,
            lock_renew_time_ms: config.lock_renew_time_ms(),
            drain_delay: config.drain_delay(),
            limiter: config.limiter.as_ref().map(|limiter| limiter.to_spec()),
            backoff_strategies: BackoffStrategies::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_limiter(mut self, limiter: LimiterSpec) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Registers a strategy for backoff specs of type `name`.
    pub fn with_backoff_strategy(
        mut self,
        name: impl Into<String>,
        strategy: Arc<dyn BackoffStrategy>,
    ) -> Self {
        self.backoff_strategies.insert(name.into(), strategy);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::configuration(
                "worker.concurrency",
                "concurrency must be greater than 0",
            ));
        }
        if self.lock_duration_ms == 0 {
            return Err(QueueError::configuration(
                "worker.lock_duration_ms",
                "lock duration must be greater than 0",
            ));
        }
        if self.lock_renew_time_ms == 0 || self.lock_renew_time_ms >= self.lock_duration_ms {
            return Err(QueueError::configuration(
                "worker.lock_renew_time_ms",
                "lock renew time must be between 0 and the lock duration",
            ));
        }
        if self.drain_delay.is_zero() {
            return Err(QueueError::configuration(
                "worker.drain_delay_secs",
                "drain delay must be greater than 0",
            ));
        }
        if let Some(limiter) = &self.limiter {
            if limiter.max == 0 || limiter.duration_ms == 0 {
                return Err(QueueError::configuration(
                    "worker.limiter",
                    "limiter max and duration must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// Local notifications of one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Active {
        job_id: JobId,
    },
    Completed {
        job_id: JobId,
        return_value: JsonValue,
    },
    /// `final_attempt` is false when the job was scheduled for a retry
    Failed {
        job_id: JobId,
        reason: String,
        final_attempt: bool,
    },
    Drained,
    /// Engine-level failure, never a job outcome
    Error {
        job_id: Option<JobId>,
        message: String,
    },
    Paused,
    Resumed,
    Closed,
}

/// Handle to a worker. Clones share the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: String,
    store: Arc<dyn AtomicStore>,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    leases: LeaseRegistry,
    repeat: Repeat,
    events: broadcast::Sender<WorkerEvent>,
    closing: CancellationToken,
    force: CancellationToken,
    closed: AtomicBool,
    paused: watch::Sender<bool>,
    active: watch::Sender<usize>,
    drained: AtomicBool,
    blocking_claim: Mutex<()>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Fails fast on options the dispatch loop cannot run with.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        options: WorkerOptions,
        processor: Arc<dyn Processor>,
    ) -> QueueResult<Self> {
        options.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let leases = LeaseRegistry::new(
            Arc::clone(&store),
            options.lock_duration_ms,
            options.lock_renew_time_ms,
        );

        Ok(Self {
            inner: Arc::new(WorkerInner {
                id: Uuid::new_v4().simple().to_string(),
                repeat: Repeat::new(Arc::clone(&store)),
                store,
                processor,
                options,
                leases,
                events,
                closing: CancellationToken::new(),
                force: CancellationToken::new(),
                closed: AtomicBool::new(false),
                paused: watch::Sender::new(false),
                active: watch::Sender::new(0),
                drained: AtomicBool::new(false),
                blocking_claim: Mutex::new(()),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Receives the worker's events from now on.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the dispatch loop in the background.
    pub async fn run(&self) -> QueueResult<()> {
        let mut running = self.inner.running.lock().await;
        if self.inner.closing.is_cancelled() {
            return Err(QueueError::validation("worker", "Worker is closed"));
        }
        if running.is_some() {
            return Err(QueueError::validation("worker", "Worker is already running"));
        }

        info!(
            worker = %self.inner.id,
            queue = %self.inner.store.queue_name(),
            concurrency = self.inner.options.concurrency,
            "Worker started"
        );
        *running = Some(tokio::spawn(Arc::clone(&self.inner).dispatch()));
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Number of jobs being processed right now.
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Stops claiming new jobs. Unless `do_not_wait` is set, returns once the
    /// jobs in flight have settled.
    pub async fn pause(&self, do_not_wait: bool) {
        if self.inner.paused.send_replace(true) {
            return;
        }
        if !do_not_wait {
            let mut active = self.inner.active.subscribe();
            let _ = active.wait_for(|count| *count == 0).await;
        }
        info!(worker = %self.inner.id, "Worker paused");
        self.inner.emit(WorkerEvent::Paused);
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            info!(worker = %self.inner.id, "Worker resumed");
            self.inner.emit(WorkerEvent::Resumed);
        }
    }

    /// Stops the worker.
    ///
    /// A graceful close lets the jobs in flight finish. A forced close
    /// abandons them without touching their records; their leases expire and
    /// the reaper moves them back to waiting.
    pub async fn close(&self, force: bool) -> QueueResult<()> {
        if force {
            self.inner.force.cancel();
        }
        self.inner.closing.cancel();

        let handle = self.inner.running.lock().await.take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| QueueError::Internal {
                source: anyhow::Error::from(e),
            })?;
        }
        self.inner.leases.cancel_all();

        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(worker = %self.inner.id, force, "Worker closed");
            self.inner.emit(WorkerEvent::Closed);
        }
        Ok(())
    }
}

impl WorkerInner {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report_error(&self, job_id: Option<&str>, error: &QueueError) {
        if error.is_protocol() || error.is_transient() {
            warn!(worker = %self.id, job_id = ?job_id, error = %error, "Worker error");
        } else {
            error!(worker = %self.id, job_id = ?job_id, error = %error, "Worker error");
        }
        self.emit(WorkerEvent::Error {
            job_id: job_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    fn is_interrupted(&self) -> bool {
        self.closing.is_cancelled() || *self.paused.borrow()
    }

    /// Resolves once the worker is closing or paused.
    async fn interrupted(&self) {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = self.closing.cancelled() => {}
            _ = async { paused.wait_for(|p| *p).await.is_ok() } => {}
        }
    }

    /// Sleeps after a store error. False when interrupted meanwhile.
    async fn back_off(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(ERROR_BACKOFF) => true,
            _ = self.interrupted() => false,
        }
    }

    fn admit_request(&self, token: &str, job_id: Option<JobId>) -> AdmitRequest {
        AdmitRequest {
            token: token.to_string(),
            lease_ms: self.options.lock_duration_ms,
            job_id,
            limiter: self.options.limiter.clone(),
            now: now_ms(),
        }
    }

    async fn dispatch(self: Arc<Self>) {
        let mut tokens: Vec<String> = (0..self.options.concurrency)
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let mut slots: JoinSet<String> = JoinSet::new();
        let mut paused = self.paused.subscribe();

        loop {
            let stopped = self.closing.is_cancelled() || *paused.borrow_and_update();
            if !stopped {
                while let Some(token) = tokens.pop() {
                    slots.spawn(Arc::clone(&self).run_slot(token));
                }
            }
            if self.closing.is_cancelled() && slots.is_empty() {
                break;
            }

            tokio::select! {
                joined = slots.join_next(), if !slots.is_empty() => match joined {
                    Some(Ok(token)) => tokens.push(token),
                    Some(Err(e)) => {
                        error!(worker = %self.id, error = %e, "Worker slot panicked");
                        tokens.push(Uuid::new_v4().to_string());
                    }
                    None => {}
                },
                _ = self.closing.cancelled(), if !self.closing.is_cancelled() => {}
                _ = paused.changed() => {}
            }
        }

        debug!(worker = %self.id, "Dispatch loop stopped");
    }

    async fn run_slot(self: Arc<Self>, token: String) -> String {
        let mut next = self.claim(&token).await;
        while let Some(job) = next {
            next = self.process_job(job, &token).await;
        }
        token
    }

    /// Claims the next job, waiting for one when the queue is empty.
    /// `None` means the worker is pausing or closing.
    async fn claim(&self, token: &str) -> Option<Job> {
        loop {
            if self.is_interrupted() {
                return None;
            }

            match self.store.admit_next(&self.admit_request(token, None)).await {
                Ok(Some(job)) => {
                    self.drained.store(false, Ordering::SeqCst);
                    return Some(job);
                }
                Ok(None) => {}
                Err(e) => {
                    self.report_error(None, &QueueError::from(e));
                    if !self.back_off().await {
                        return None;
                    }
                    continue;
                }
            }

            if !self.drained.swap(true, Ordering::SeqCst) {
                debug!(worker = %self.id, queue = %self.store.queue_name(), "Queue drained");
                self.emit(WorkerEvent::Drained);
            }

            let _blocking = tokio::select! {
                guard = self.blocking_claim.lock() => guard,
                _ = self.interrupted() => return None,
            };
            let waited = tokio::select! {
                waited = self.store.wait_for_job(self.options.drain_delay) => waited,
                _ = self.interrupted() => return None,
            };

            let failed = match waited {
                Ok(Some(job_id)) => {
                    match self.store.admit_next(&self.admit_request(token, Some(job_id))).await {
                        Ok(Some(job)) => {
                            self.drained.store(false, Ordering::SeqCst);
                            return Some(job);
                        }
                        Ok(None) => None,
                        Err(e) => Some(e),
                    }
                }
                Ok(None) => None,
                Err(e) => Some(e),
            };
            if let Some(e) = failed {
                self.report_error(None, &QueueError::from(e));
                if !self.back_off().await {
                    return None;
                }
            }
        }
    }

    async fn process_job(&self, job: Job, token: &str) -> Option<Job> {
        self.active.send_modify(|count| *count += 1);
        let next = self.execute(job, token).await;
        self.active.send_modify(|count| *count -= 1);
        next
    }

    async fn execute(&self, job: Job, token: &str) -> Option<Job> {
        let job_id = job.id.clone();
        debug!(worker = %self.id, job_id = %job_id, name = %job.name, "Processing job");

        if job.opts.repeat.is_some() {
            if let Err(e) = self
                .repeat
                .schedule_next(&job.name, job.data.clone(), &job.opts, true)
                .await
            {
                self.report_error(Some(&job_id), &e);
            }
        }

        self.emit(WorkerEvent::Active {
            job_id: job_id.clone(),
        });

        let lost = self.leases.start(&job_id, token);
        let cancellation = self.force.child_token();
        let ctx = JobContext::new(Arc::clone(&self.store), &job, cancellation.clone());

        let result = tokio::select! {
            result = self.run_processor(&job, &ctx) => Some(result),
            _ = lost.cancelled() => None,
            _ = self.force.cancelled() => None,
        };
        self.leases.cancel(&job_id);

        let Some(result) = result else {
            cancellation.cancel();
            if lost.is_cancelled() {
                self.report_error(
                    Some(&job_id),
                    &QueueError::MissingLease {
                        job_id: job_id.clone(),
                        command: "process".to_string(),
                    },
                );
            } else {
                debug!(worker = %self.id, job_id = %job_id, "Job abandoned on forced close");
            }
            return None;
        };

        match result {
            Ok(value) => self.complete(job, token, value).await,
            Err(err) => {
                self.fail(job, token, err, ctx.is_discarded()).await;
                None
            }
        }
    }

    async fn run_processor(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        let run = self.processor.process(job, ctx);
        match job.opts.timeout {
            Some(timeout_ms) if timeout_ms > 0 => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessorError::new(format!(
                        "Job timed out after {} ms",
                        timeout_ms
                    ))),
                }
            }
            _ => run.await,
        }
    }

    async fn complete(&self, job: Job, token: &str, return_value: JsonValue) -> Option<Job> {
        // A pausing or closing worker does not take on more work.
        let fetch_next = (!self.is_interrupted()).then(|| self.admit_request(token, None));
        let request = FinalizeRequest {
            job_id: job.id.clone(),
            token: token.to_string(),
            outcome: Outcome::Completed {
                return_value: return_value.clone(),
            },
            retention: job.opts.completion_retention(),
            now: now_ms(),
            fetch_next,
        };

        match self.store.finalize(&request).await {
            Ok(next) => {
                debug!(worker = %self.id, job_id = %job.id, "Job completed");
                self.emit(WorkerEvent::Completed {
                    job_id: job.id,
                    return_value,
                });
                if next.is_some() {
                    self.drained.store(false, Ordering::SeqCst);
                }
                next
            }
            Err(e) => {
                self.report_error(Some(&job.id), &QueueError::from(e));
                None
            }
        }
    }

    async fn fail(&self, mut job: Job, token: &str, error: ProcessorError, discarded: bool) {
        job.attempts_made += 1;
        job.push_stacktrace(error.trace());
        let attempt = AttemptRecord {
            attempts_made: job.attempts_made,
            failed_reason: error.message.clone(),
            stacktrace: job.stacktrace.clone(),
        };

        let retry_delay = if discarded
            || error.unrecoverable
            || job.attempts_made >= job.opts.max_attempts()
        {
            None
        } else {
            match compute_delay(
                job.opts.backoff.as_ref(),
                job.attempts_made,
                &error,
                &self.options.backoff_strategies,
            )
            .await
            {
                Ok(NO_RETRY) => None,
                Ok(delay) => Some(delay.max(0)),
                Err(e) => {
                    warn!(worker = %self.id, job_id = %job.id, error = %e, "Backoff failed, not retrying");
                    None
                }
            }
        };

        let now = now_ms();
        let moved = match retry_delay {
            Some(delay) if delay > 0 => {
                self.store
                    .move_to_delayed(&DelayRequest {
                        job_id: job.id.clone(),
                        due: now.saturating_add(delay),
                        token: Some(token.to_string()),
                        attempt: Some(attempt),
                        now,
                    })
                    .await
            }
            Some(_) => {
                self.store
                    .requeue(&RequeueRequest {
                        job_id: job.id.clone(),
                        token: token.to_string(),
                        lifo: job.opts.lifo,
                        attempt,
                    })
                    .await
            }
            None => self
                .store
                .finalize(&FinalizeRequest {
                    job_id: job.id.clone(),
                    token: token.to_string(),
                    outcome: Outcome::Failed(attempt),
                    retention: job.opts.failure_retention(),
                    now,
                    fetch_next: None,
                })
                .await
                .map(|_| ()),
        };

        match moved {
            Ok(()) => {
                let final_attempt = retry_delay.is_none();
                debug!(
                    worker = %self.id,
                    job_id = %job.id,
                    attempts_made = job.attempts_made,
                    retry_delay = ?retry_delay,
                    "Job failed: {}",
                    error.message
                );
                self.emit(WorkerEvent::Failed {
                    job_id: job.id,
                    reason: error.message,
                    final_attempt,
                });
            }
            Err(e) => self.report_error(Some(&job.id), &QueueError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::SchedulerConfig;
    use crate::jobs::{BackoffSpec, JobOptions, JobState, RepeatOptions};
    use crate::scheduler::QueueScheduler;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    fn options(concurrency: usize) -> WorkerOptions {
        WorkerOptions {
            concurrency,
            lock_duration_ms: 5_000,
            lock_renew_time_ms: 1_000,
            drain_delay: Duration::from_millis(200),
            limiter: None,
            backoff_strategies: BackoffStrategies::new(),
        }
    }

    fn scheduler(store: &Arc<MemoryStore>) -> QueueScheduler {
        let config = SchedulerConfig {
            stalled_interval_ms: 5_000,
            max_stalled_count: 1,
            max_delay_poll_ms: 50,
        };
        QueueScheduler::new(store.clone(), config).unwrap()
    }

    async fn add(store: &Arc<MemoryStore>, name: &str, opts: JobOptions) -> JobId {
        store.enqueue(&Job::new(name, json!({}), opts)).await.unwrap()
    }

    async fn eventually<F, Fut>(timeout_ms: u64, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met within {} ms", timeout_ms);
    }

    async fn wait_for_state(store: &Arc<MemoryStore>, job_id: &str, state: JobState, timeout_ms: u64) {
        eventually(timeout_ms, || async {
            store.get_state(job_id).await.unwrap() == state
        })
        .await;
    }

    #[test]
    fn test_invalid_options_rejected() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let processor = processor_fn(|_job: Job, _ctx: JobContext| async { Ok::<_, ProcessorError>(json!(null)) });

        let err = Worker::new(store.clone(), options(0), processor.clone()).err().unwrap();
        assert!(matches!(err, QueueError::Configuration { ref key, .. } if key == "worker.concurrency"));

        let mut bad_renew = options(1);
        bad_renew.lock_renew_time_ms = bad_renew.lock_duration_ms;
        assert!(Worker::new(store, bad_renew, processor).is_err());
    }

    #[test]
    fn test_options_from_config() {
        let config = WorkerConfig {
            concurrency: 3,
            lock_duration_ms: 10_000,
            lock_renew_time_ms: None,
            drain_delay_secs: 2,
            limiter: None,
        };
        let options = WorkerOptions::from_config(&config);
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.lock_renew_time_ms, 5_000);
        assert_eq!(options.drain_delay, Duration::from_secs(2));
        assert!(options.validate().is_ok());
    }

    #[tokio::test]
    async fn test_workers_never_share_a_job() {
        let store = Arc::new(MemoryStore::new("worker", 1000));
        let total = 30;
        for i in 0..total {
            add(&store, &format!("job-{}", i), JobOptions::default()).await;
        }

        let in_flight = Arc::new(StdMutex::new(HashSet::new()));
        let processed = Arc::new(StdMutex::new(Vec::new()));
        let overlaps = Arc::new(StdMutex::new(0usize));

        let processor = {
            let (in_flight, processed, overlaps) = (in_flight.clone(), processed.clone(), overlaps.clone());
            processor_fn(move |job: Job, _ctx: JobContext| {
                let (in_flight, processed, overlaps) = (in_flight.clone(), processed.clone(), overlaps.clone());
                async move {
                    if !in_flight.lock().unwrap().insert(job.id.clone()) {
                        *overlaps.lock().unwrap() += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.lock().unwrap().remove(&job.id);
                    processed.lock().unwrap().push(job.id.clone());
                    Ok::<_, ProcessorError>(json!(null))
                }
            })
        };

        let mut workers = Vec::new();
        for _ in 0..3 {
            let worker = Worker::new(store.clone(), options(2), processor.clone()).unwrap();
            worker.run().await.unwrap();
            workers.push(worker);
        }

        eventually(5_000, || async {
            store.count(JobState::Completed).await.unwrap() == total
        })
        .await;
        for worker in &workers {
            worker.close(false).await.unwrap();
        }

        let processed = processed.lock().unwrap();
        let distinct: HashSet<_> = processed.iter().collect();
        assert_eq!(processed.len(), total as usize);
        assert_eq!(distinct.len(), total as usize);
        assert_eq!(*overlaps.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_job_fails_after_exactly_k_attempts() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let job_id = add(&store, "flaky", JobOptions::default().with_attempts(3)).await;

        let calls = Arc::new(StdMutex::new(0u32));
        let processor = {
            let calls = calls.clone();
            processor_fn(move |_job: Job, _ctx: JobContext| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err::<JsonValue, _>(ProcessorError::new("always broken"))
                }
            })
        };

        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();
        wait_for_state(&store, &job_id, JobState::Failed, 3_000).await;
        // Give a wrongly scheduled extra attempt the chance to show up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.close(false).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 3);
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some("always broken"));
        assert_eq!(job.stacktrace.len(), 3);
    }

    /// Fails the first two invocations of every job, then succeeds.
    fn fails_twice(started: Arc<StdMutex<Vec<i64>>>) -> Arc<dyn Processor> {
        processor_fn(move |_job: Job, _ctx: JobContext| {
            let started = started.clone();
            async move {
                let attempt = {
                    let mut started = started.lock().unwrap();
                    started.push(now_ms());
                    started.len()
                };
                if attempt <= 2 {
                    Err(ProcessorError::new(format!("failure {}", attempt)))
                } else {
                    Ok(json!("done"))
                }
            }
        })
    }

    async fn run_backoff_scenario(backoff: BackoffSpec, timeout_ms: u64) -> (Vec<i64>, Job) {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let job_id = add(
            &store,
            "retry",
            JobOptions::default().with_attempts(3).with_backoff(backoff),
        )
        .await;

        let started = Arc::new(StdMutex::new(Vec::new()));
        let scheduler = scheduler(&store);
        let scheduler_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        let worker = Worker::new(store.clone(), options(1), fails_twice(started.clone())).unwrap();
        worker.run().await.unwrap();

        wait_for_state(&store, &job_id, JobState::Completed, timeout_ms).await;
        worker.close(false).await.unwrap();
        scheduler.close();
        scheduler_task.await.unwrap().unwrap();

        let started = started.lock().unwrap().clone();
        (started, store.get_job(&job_id).await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_fixed_backoff_spaces_retries() {
        let (started, job) = run_backoff_scenario(BackoffSpec::fixed(1000), 6_000).await;
        assert_eq!(started.len(), 3);
        assert!(started[1] - started[0] >= 1000);
        assert!(started[2] - started[1] >= 1000);
        assert!(job.finished_on.unwrap() - started[0] >= 2000);
        assert_eq!(job.return_value, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_exponential_backoff_grows() {
        let (started, job) = run_backoff_scenario(BackoffSpec::exponential(200), 5_000).await;
        assert_eq!(started.len(), 3);
        assert!(started[1] - started[0] >= 200);
        assert!(started[2] - started[1] >= 600);
        // 200 * (2^1 - 1) + 200 * (2^2 - 1)
        assert!(job.finished_on.unwrap() - started[0] >= 800);
    }

    #[tokio::test]
    async fn test_lifo_jobs_added_while_paused_run_newest_first() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        store.pause(true).await.unwrap();
        let a = add(&store, "a", JobOptions::default().with_lifo()).await;
        let b = add(&store, "b", JobOptions::default().with_lifo()).await;
        assert_eq!(store.get_state(&a).await.unwrap(), JobState::Paused);
        store.pause(false).await.unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let processor = {
            let order = order.clone();
            processor_fn(move |job: Job, _ctx: JobContext| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(job.name.clone());
                    Ok::<_, ProcessorError>(json!(null))
                }
            })
        };
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();
        wait_for_state(&store, &a, JobState::Completed, 3_000).await;
        wait_for_state(&store, &b, JobState::Completed, 3_000).await;
        worker.close(false).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_rate_limiter_delays_the_rest() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        for name in ["a", "b", "c", "d"] {
            add(&store, name, JobOptions::default()).await;
        }

        let processor = processor_fn(|_job: Job, _ctx: JobContext| async { Ok::<_, ProcessorError>(json!(null)) });
        let limited = options(1).with_limiter(LimiterSpec {
            max: 1,
            duration_ms: 1000,
            group_key: None,
        });
        let worker = Worker::new(store.clone(), limited, processor).unwrap();
        worker.run().await.unwrap();

        eventually(2_000, || async {
            store.count(JobState::Delayed).await.unwrap() == 3
        })
        .await;
        worker.close(false).await.unwrap();

        assert_eq!(store.count(JobState::Completed).await.unwrap(), 1);
        let dues: Vec<i64> = store
            .delayed_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|(_, due)| due)
            .collect();
        assert_eq!(dues.len(), 3);
        assert!(dues.windows(2).all(|pair| pair[1] - pair[0] >= 1000));
    }

    #[tokio::test]
    async fn test_discard_skips_remaining_attempts() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let job_id = add(&store, "bad", JobOptions::default().with_attempts(5)).await;

        let processor = processor_fn(|_job: Job, ctx: JobContext| async move {
            ctx.discard();
            Err::<JsonValue, _>(ProcessorError::new("permanent"))
        });
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();
        wait_for_state(&store, &job_id, JobState::Failed, 2_000).await;
        worker.close(false).await.unwrap();

        assert_eq!(store.get_job(&job_id).await.unwrap().unwrap().attempts_made, 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_the_attempt() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let mut opts = JobOptions::default();
        opts.timeout = Some(50);
        let job_id = add(&store, "slow", opts).await;

        let processor = processor_fn(|_job: Job, _ctx: JobContext| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProcessorError>(json!(null))
        });
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();
        wait_for_state(&store, &job_id, JobState::Failed, 2_000).await;
        worker.close(false).await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert!(job.failed_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_events_follow_the_lifecycle() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let processor = processor_fn(|job: Job, _ctx: JobContext| async move {
            Ok::<_, ProcessorError>(json!({"name": job.name}))
        });
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        let mut events = worker.events();
        let job_id = add(&store, "hello", JobOptions::default()).await;
        worker.run().await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event);
        }
        worker.close(false).await.unwrap();

        assert_eq!(seen[0], WorkerEvent::Active { job_id: job_id.clone() });
        assert_eq!(
            seen[1],
            WorkerEvent::Completed {
                job_id,
                return_value: json!({"name": "hello"})
            }
        );
        assert_eq!(seen[2], WorkerEvent::Drained);
    }

    #[tokio::test]
    async fn test_local_pause_stops_claiming() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let processor = processor_fn(|_job: Job, _ctx: JobContext| async { Ok::<_, ProcessorError>(json!(null)) });
        let worker = Worker::new(store.clone(), options(2), processor).unwrap();
        worker.run().await.unwrap();

        worker.pause(false).await;
        assert!(worker.is_paused());
        let job_id = add(&store, "later", JobOptions::default()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get_state(&job_id).await.unwrap(), JobState::Waiting);

        worker.resume();
        wait_for_state(&store, &job_id, JobState::Completed, 2_000).await;
        worker.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_close_leaves_job_active() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let job_id = add(&store, "long", JobOptions::default()).await;
        let processor = processor_fn(|_job: Job, _ctx: JobContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ProcessorError>(json!(null))
        });
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();
        wait_for_state(&store, &job_id, JobState::Active, 2_000).await;

        worker.close(true).await.unwrap();
        assert_eq!(store.get_state(&job_id).await.unwrap(), JobState::Active);
        assert!(worker.run().await.is_err());
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_job_without_writing() {
        let store = Arc::new(MemoryStore::new("worker", 100));
        let job_id = add(&store, "slow", JobOptions::default().with_attempts(3)).await;
        let processor = processor_fn(|_job: Job, _ctx: JobContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ProcessorError>(json!("late"))
        });
        let mut opts = options(1);
        opts.lock_duration_ms = 200;
        opts.lock_renew_time_ms = 50;
        let worker = Worker::new(store.clone(), opts, processor).unwrap();
        let mut events = worker.events();
        worker.run().await.unwrap();
        wait_for_state(&store, &job_id, JobState::Active, 2_000).await;

        // The lease lapses, the reaper reclaims the job and another worker takes it.
        store.expire_lease(&job_id);
        store.reap_stalled(1, now_ms(), 0).await.unwrap();
        let reclaimed = store.reap_stalled(1, now_ms(), 0).await.unwrap();
        assert_eq!(reclaimed.stalled, vec![job_id.clone()]);
        let other = AdmitRequest {
            token: "other-worker".to_string(),
            lease_ms: 60_000,
            job_id: None,
            limiter: None,
            now: now_ms(),
        };
        store.admit_next(&other).await.unwrap();

        let error = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let WorkerEvent::Error { job_id, message } = events.recv().await.unwrap() {
                    return (job_id, message);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(error.0.as_deref(), Some(job_id.as_str()));
        assert!(error.1.contains("Missing lease"));
        assert!(error.1.contains("process"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.close(true).await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(store.get_state(&job_id).await.unwrap(), JobState::Active);
        assert_eq!(job.attempts_made, 0);
        assert!(job.finished_on.is_none());
        assert!(job.failed_reason.is_none());
        assert!(job.return_value.is_none());
    }

    #[tokio::test]
    async fn test_repeat_job_schedules_successor() {
        let store = Arc::new(MemoryStore::new("worker", 1000));
        let repeat = Repeat::new(store.clone());
        let opts = JobOptions::default().with_repeat(RepeatOptions {
            limit: Some(3),
            ..RepeatOptions::every(100)
        });
        repeat
            .schedule_next("tick", json!({}), &opts, false)
            .await
            .unwrap()
            .unwrap();

        let processor = processor_fn(|_job: Job, _ctx: JobContext| async { Ok::<_, ProcessorError>(json!(null)) });
        let scheduler = scheduler(&store);
        let scheduler_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        let worker = Worker::new(store.clone(), options(1), processor).unwrap();
        worker.run().await.unwrap();

        eventually(3_000, || async {
            store.count(JobState::Completed).await.unwrap() == 3
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.close(false).await.unwrap();
        scheduler.close();
        scheduler_task.await.unwrap().unwrap();

        assert_eq!(store.count(JobState::Completed).await.unwrap(), 3);
        assert_eq!(store.count(JobState::Delayed).await.unwrap(), 0);
    }
}
