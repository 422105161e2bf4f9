//! AtomicStore trait definition.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::jobs::{Job, JobId, JobState};
use crate::store::StoreResult;
use crate::store::types::{
    AdmitRequest, DelayRequest, EventId, EventRecord, FinalizeRequest, Promotion,
    RequeueRequest, StalledReport,
};

/// Atomic operations against one queue's shared structures.
///
/// Every method is a single indivisible transaction in the backing store:
/// a job id is never observed in two of the waiting, delayed, active,
/// completed and failed structures at once, and no caller performs an
/// unguarded read-then-write against them. Each state move appends its
/// event record inside the same transaction.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Queue name this store operates on.
    fn queue_name(&self) -> &str;

    /// Stores a new job in waiting (or the paused intake) or delayed and
    /// returns its id. A custom id that already exists is returned untouched.
    async fn enqueue(&self, job: &Job) -> StoreResult<JobId>;

    /// Admits the next waiting job, or the job named in the request, under a
    /// new lease. A rate-limited candidate is moved to delayed instead and
    /// `None` is returned.
    async fn admit_next(&self, request: &AdmitRequest) -> StoreResult<Option<Job>>;

    /// Blocks up to `timeout` for a waiting job and moves its id to active.
    /// The caller must follow up with [`AtomicStore::admit_next`] naming it.
    async fn wait_for_job(&self, timeout: Duration) -> StoreResult<Option<JobId>>;

    /// Moves an active job to completed or failed. Fails with a missing-key
    /// or missing-lease error without touching anything else.
    async fn finalize(&self, request: &FinalizeRequest) -> StoreResult<Option<Job>>;

    async fn move_to_delayed(&self, request: &DelayRequest) -> StoreResult<()>;

    /// Active → waiting for an immediate retry.
    async fn requeue(&self, request: &RequeueRequest) -> StoreResult<()>;

    /// Moves up to `limit` delayed jobs due at `now` into the intake.
    async fn promote_delayed(&self, now: i64, limit: usize) -> StoreResult<Promotion>;

    /// Moves one delayed job into the intake regardless of its due time.
    async fn promote_job(&self, job_id: &str) -> StoreResult<bool>;

    /// Extends the lease if `token` still owns it. `false` means the lease is gone.
    async fn extend_lease(&self, job_id: &str, token: &str, lease_ms: u64) -> StoreResult<bool>;

    /// One reaper pass, skipped when another pass ran within `interval_ms`.
    async fn reap_stalled(
        &self,
        max_stalled: u32,
        now: i64,
        interval_ms: u64,
    ) -> StoreResult<StalledReport>;

    /// Deletes a job that is not locked. Returns whether it existed.
    async fn remove(&self, job_id: &str) -> StoreResult<bool>;

    async fn pause(&self, paused: bool) -> StoreResult<()>;

    async fn is_paused(&self) -> StoreResult<bool>;

    /// Finished job → waiting, only from `expected` (completed or failed).
    async fn retry(&self, job_id: &str, expected: JobState, lifo: bool) -> StoreResult<()>;

    async fn update_progress(&self, job_id: &str, progress: &JsonValue) -> StoreResult<()>;

    /// Appends a log line, returning the number of lines.
    async fn add_log(&self, job_id: &str, line: &str) -> StoreResult<u64>;

    async fn logs(&self, job_id: &str) -> StoreResult<Vec<String>>;

    /// Removes unlocked jobs of `state` whose timestamp is at or before
    /// `older_than`, at most `limit` of them (0 = no limit).
    async fn clean(&self, state: JobState, older_than: i64, limit: usize)
    -> StoreResult<Vec<JobId>>;

    /// Removes every waiting job, and delayed ones when asked.
    async fn drain(&self, include_delayed: bool) -> StoreResult<u64>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>>;

    async fn get_state(&self, job_id: &str) -> StoreResult<JobState>;

    async fn count(&self, state: JobState) -> StoreResult<u64>;

    /// Delayed job ids with their due times, earliest first.
    async fn delayed_jobs(&self) -> StoreResult<Vec<(JobId, i64)>>;

    async fn last_event_id(&self) -> StoreResult<Option<EventId>>;

    /// Reads events after `after`, waiting up to `block` when none are there.
    async fn read_events(
        &self,
        after: EventId,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<EventRecord>>;

    /// Trims the event log to roughly `max_len` entries, oldest first.
    async fn trim_events(&self, max_len: u64) -> StoreResult<u64>;

    async fn upsert_repeatable(&self, key: &str, next_millis: i64) -> StoreResult<()>;

    /// Next scheduled fire time of a repeatable descriptor, if registered.
    async fn repeatable_next(&self, key: &str) -> StoreResult<Option<i64>>;

    async fn remove_repeatable(&self, key: &str) -> StoreResult<bool>;

    async fn repeatables(&self) -> StoreResult<Vec<(String, i64)>>;
}
