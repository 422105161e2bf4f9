//! Producer and admin surface of one queue.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::config::settings::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvents;
use crate::jobs::{Job, JobId, JobOptions, JobState, RepeatOptions};
use crate::scheduler::repeat::validate_repeat;
use crate::scheduler::{Repeat, RepeatableJob};
use crate::store::{AtomicStore, StoreManager};
use crate::utils::now_ms;

/// Adds jobs to a queue and manages the jobs already in it.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn AtomicStore>,
    default_job_options: JobOptions,
    repeat: Repeat,
}

impl Queue {
    pub fn new(store: Arc<dyn AtomicStore>, default_job_options: JobOptions) -> Self {
        Self {
            repeat: Repeat::new(Arc::clone(&store)),
            store,
            default_job_options,
        }
    }

    pub fn from_manager(manager: &StoreManager, config: &QueueConfig) -> Self {
        Self::new(Arc::clone(manager.backend()), config.default_job_options.clone())
    }

    pub fn name(&self) -> &str {
        self.store.queue_name()
    }

    pub fn store(&self) -> Arc<dyn AtomicStore> {
        Arc::clone(&self.store)
    }

    /// Event consumer of this queue.
    pub fn events(&self) -> QueueEvents {
        QueueEvents::new(Arc::clone(&self.store))
    }

    /// Adds a job. Options left unset fall back to the queue defaults.
    ///
    /// A job with a repeat spec registers the repeatable descriptor and adds
    /// its first occurrence instead; a custom id becomes part of the repeat key.
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: JsonValue,
        opts: JobOptions,
    ) -> QueueResult<Job> {
        let name = name.into();
        let mut opts = opts.merged_with(&self.default_job_options);
        opts.validate()?;

        if let Some(mut repeat) = opts.repeat.take() {
            validate_repeat(&repeat)?;
            if let Some(job_id) = opts.job_id.take() {
                repeat.job_id = Some(job_id);
            }
            opts.repeat = Some(repeat);
            return self
                .repeat
                .schedule_next(&name, data, &opts, false)
                .await?
                .ok_or_else(|| QueueError::validation("repeat", "Schedule has no future occurrence"));
        }

        let mut job = Job::new(name, data, opts);
        job.id = self.store.enqueue(&job).await?;
        debug!(queue = %self.name(), job_id = %job.id, name = %job.name, "Job added");
        Ok(job)
    }

    /// Adds jobs one after another, stopping at the first failure.
    pub async fn add_bulk(&self, jobs: Vec<(String, JsonValue, JobOptions)>) -> QueueResult<Vec<Job>> {
        let mut added = Vec::with_capacity(jobs.len());
        for (name, data, opts) in jobs {
            added.push(self.add(name, data, opts).await?);
        }
        Ok(added)
    }

    /// Stops admission for every worker of the queue.
    pub async fn pause(&self) -> QueueResult<()> {
        self.store.pause(true).await?;
        info!(queue = %self.name(), "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.store.pause(false).await?;
        info!(queue = %self.name(), "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        Ok(self.store.is_paused().await?)
    }

    /// Removes up to `limit` jobs (0 = all) in `state` finished or created
    /// more than `grace_ms` ago.
    pub async fn clean(&self, grace_ms: u64, limit: usize, state: JobState) -> QueueResult<Vec<JobId>> {
        if state == JobState::Unknown {
            return Err(QueueError::validation("state", "Cannot clean jobs in the unknown state"));
        }
        let older_than = now_ms() - grace_ms as i64;
        let removed = self.store.clean(state, older_than, limit).await?;
        info!(queue = %self.name(), state = %state, removed = removed.len(), "Queue cleaned");
        Ok(removed)
    }

    /// Removes every waiting job, and the delayed ones when asked.
    pub async fn drain(&self, include_delayed: bool) -> QueueResult<u64> {
        let removed = self.store.drain(include_delayed).await?;
        info!(queue = %self.name(), removed, include_delayed, "Queue drained");
        Ok(removed)
    }

    /// Deletes a job that is not being processed.
    pub async fn remove(&self, job_id: &str) -> QueueResult<bool> {
        Ok(self.store.remove(job_id).await?)
    }

    /// Moves a finished job back to waiting. `expected` is the state the job
    /// must currently be in, completed or failed.
    pub async fn retry_job(&self, job_id: &str, expected: JobState) -> QueueResult<()> {
        if !expected.is_finished() {
            return Err(QueueError::validation(
                "state",
                format!("Jobs can only be retried from completed or failed, not {}", expected),
            ));
        }
        let job = self.get_job(job_id).await?.ok_or_else(|| QueueError::NotFound {
            entity: "job".to_string(),
            field: "id".to_string(),
            value: job_id.to_string(),
        })?;
        self.store.retry(job_id, expected, job.opts.lifo).await?;
        info!(queue = %self.name(), job_id, from = %expected, "Job retried");
        Ok(())
    }

    /// Moves a delayed job to waiting now.
    pub async fn promote(&self, job_id: &str) -> QueueResult<()> {
        if self.store.promote_job(job_id).await? {
            Ok(())
        } else {
            Err(QueueError::validation(
                "job_id",
                format!("Job {} is not delayed", job_id),
            ))
        }
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn get_job_state(&self, job_id: &str) -> QueueResult<JobState> {
        Ok(self.store.get_state(job_id).await?)
    }

    pub async fn get_job_logs(&self, job_id: &str) -> QueueResult<Vec<String>> {
        Ok(self.store.logs(job_id).await?)
    }

    pub async fn update_progress(&self, job_id: &str, progress: JsonValue) -> QueueResult<()> {
        Ok(self.store.update_progress(job_id, &progress).await?)
    }

    pub async fn add_log(&self, job_id: &str, line: &str) -> QueueResult<u64> {
        Ok(self.store.add_log(job_id, line).await?)
    }

    pub async fn trim_events(&self, max_len: u64) -> QueueResult<u64> {
        Ok(self.store.trim_events(max_len).await?)
    }

    pub async fn count(&self, state: JobState) -> QueueResult<u64> {
        Ok(self.store.count(state).await?)
    }

    /// Unregisters a repeatable job and drops its pending occurrence.
    pub async fn remove_repeatable(&self, name: &str, repeat: &RepeatOptions) -> QueueResult<bool> {
        self.repeat.remove(name, repeat).await
    }

    pub async fn remove_repeatable_by_key(&self, key: &str) -> QueueResult<bool> {
        self.repeat.remove_by_key(key).await
    }

    pub async fn repeatable_jobs(&self) -> QueueResult<Vec<RepeatableJob>> {
        self.repeat.list().await
    }
}
