//! In-process store. One mutex guards every structure of the queue, which makes
//! each operation atomic the same way a server-side script is. Engine tests and
//! single-process deployments run against it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::jobs::{Job, JobId, JobState, Retention, delayed_score, due_from_score, id_sequence};
use crate::store::types::{
    AdmitRequest, AttemptRecord, DelayRequest, EventId, EventRecord, FinalizeRequest,
    LimiterSpec, Outcome, Promotion, RequeueRequest, STALLED_FAILURE_REASON, StalledReport,
    event_name,
};
use crate::store::{AtomicStore, StoreError, StoreResult};
use crate::utils::now_ms;

/// Ordered set keyed by member with an integer score.
#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.by_score.remove(&(old, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.by_score.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    fn score(&self, member: &str) -> Option<i64> {
        self.scores.get(member).copied()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn count_range(&self, min: i64, max: i64) -> usize {
        self.by_score
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .count()
    }

    fn range_to(&self, max: i64, limit: usize) -> Vec<String> {
        self.by_score
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn first(&self) -> Option<i64> {
        self.by_score.iter().next().map(|(score, _)| *score)
    }

    fn entries(&self) -> Vec<(String, i64)> {
        self.by_score
            .iter()
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn members(&self) -> Vec<String> {
        self.by_score.iter().map(|(_, m)| m.clone()).collect()
    }

    fn members_desc(&self) -> Vec<String> {
        self.by_score.iter().rev().map(|(_, m)| m.clone()).collect()
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: i64,
}

#[derive(Debug)]
struct Window {
    count: u64,
    expires_at: i64,
}

/// Queue structures. Lists follow the left/right convention of the Redis
/// layout: producers push on the front (left), consumers pop from the back
/// (right), so `push_back` places a job at the head of the line.
#[derive(Debug, Default)]
struct QueueData {
    jobs: HashMap<String, HashMap<String, String>>,
    logs: HashMap<String, Vec<String>>,
    wait: VecDeque<String>,
    paused_list: VecDeque<String>,
    paused: bool,
    active: VecDeque<String>,
    delayed: SortedSet,
    priority: SortedSet,
    completed: SortedSet,
    failed: SortedSet,
    locks: HashMap<String, Lease>,
    stalled: HashSet<String>,
    stalled_check_until: i64,
    limiter: HashMap<String, Window>,
    counter: u64,
    events: VecDeque<EventRecord>,
    last_event: EventId,
    events_max_len: u64,
    repeat: SortedSet,
}

fn remove_one(list: &mut VecDeque<String>, job_id: &str) -> bool {
    match list.iter().rposition(|id| id == job_id) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

impl QueueData {
    fn intake(&mut self) -> &mut VecDeque<String> {
        if self.paused {
            &mut self.paused_list
        } else {
            &mut self.wait
        }
    }

    fn emit(&mut self, name: &str, job_id: Option<&str>, fields: Vec<(&str, String)>) {
        let millis = now_ms().max(0) as u64;
        let id = if millis > self.last_event.millis {
            EventId::new(millis, 0)
        } else {
            EventId::new(self.last_event.millis, self.last_event.sequence + 1)
        };
        self.last_event = id;
        self.events.push_back(EventRecord {
            id,
            name: name.to_string(),
            job_id: job_id.map(str::to_string),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        while self.events.len() as u64 > self.events_max_len {
            self.events.pop_front();
        }
    }

    fn field(&self, job_id: &str, field: &str) -> Option<&str> {
        self.jobs
            .get(job_id)
            .and_then(|hash| hash.get(field))
            .map(String::as_str)
    }

    fn set_field(&mut self, job_id: &str, field: &str, value: String) {
        if let Some(hash) = self.jobs.get_mut(job_id) {
            hash.insert(field.to_string(), value);
        }
    }

    fn priority_of(&self, job_id: &str) -> u32 {
        self.field(job_id, "priority")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    fn load_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        match self.jobs.get(job_id) {
            Some(hash) => Ok(Some(Job::from_hash(job_id, hash)?)),
            None => Ok(None),
        }
    }

    fn lock_owner(&self, job_id: &str, now: i64) -> Option<&str> {
        self.locks
            .get(job_id)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.token.as_str())
    }

    fn delete_job(&mut self, job_id: &str) -> bool {
        self.logs.remove(job_id);
        self.locks.remove(job_id);
        self.jobs.remove(job_id).is_some()
    }

    fn add_to_wait(&mut self, job_id: &str, priority: u32, lifo: bool) {
        if priority == 0 {
            let list = self.intake();
            if lifo {
                list.push_back(job_id.to_string());
            } else {
                list.push_front(job_id.to_string());
            }
            return;
        }

        self.priority.insert(job_id, priority as i64);
        let higher_or_equal = self.priority.count_range(0, priority as i64);
        let list = self.intake();
        let index = list.len().saturating_sub(higher_or_equal - 1);
        if index >= list.len() {
            list.push_back(job_id.to_string());
        } else {
            list.insert(index, job_id.to_string());
        }
    }

    fn apply_attempt(&mut self, job_id: &str, attempt: &AttemptRecord) -> StoreResult<()> {
        let stacktrace = serde_json::to_string(&attempt.stacktrace)?;
        self.set_field(job_id, "attemptsMade", attempt.attempts_made.to_string());
        self.set_field(job_id, "stacktrace", stacktrace);
        self.set_field(job_id, "failedReason", attempt.failed_reason.clone());
        Ok(())
    }

    fn verify_lease(
        &mut self,
        job_id: &str,
        token: Option<&str>,
        command: &str,
        now: i64,
    ) -> StoreResult<()> {
        if !self.jobs.contains_key(job_id) {
            return Err(StoreError::MissingJobKey {
                job_id: job_id.to_string(),
                command: command.to_string(),
            });
        }
        if let Some(token) = token {
            if self.lock_owner(job_id, now) != Some(token) {
                return Err(StoreError::MissingLease {
                    job_id: job_id.to_string(),
                    command: command.to_string(),
                });
            }
            self.locks.remove(job_id);
        }
        self.stalled.remove(job_id);
        remove_one(&mut self.active, job_id);
        Ok(())
    }

    fn limiter_group(&self, job_id: &str, field: &str) -> Option<String> {
        if let Some(key) = self.field(job_id, "rlk") {
            return Some(key.to_string());
        }
        let data: JsonValue = serde_json::from_str(self.field(job_id, "data")?).ok()?;
        match data.get(field)? {
            JsonValue::Null => None,
            JsonValue::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Counts one admission against the window; returns the due time when over quota.
    fn check_limiter(&mut self, job_id: &str, limiter: &LimiterSpec, now: i64) -> Option<i64> {
        let mut bucket = "limiter".to_string();
        if let Some(field) = &limiter.group_key {
            if let Some(group) = self.limiter_group(job_id, field) {
                bucket = format!("limiter:{}", group);
            }
        }
        let duration = limiter.duration_ms as i64;
        let window = self.limiter.entry(bucket).or_insert(Window {
            count: 0,
            expires_at: 0,
        });
        if window.expires_at <= now {
            window.count = 0;
        }
        window.count += 1;
        if window.count == 1 {
            window.expires_at = now + duration;
        }
        if window.count > limiter.max {
            let ttl = window.expires_at - now;
            let backlog = ((window.count - limiter.max - 1) as i64 * duration) / limiter.max as i64;
            Some(now + ttl + backlog)
        } else {
            None
        }
    }

    fn admit(&mut self, request: &AdmitRequest, now: i64) -> StoreResult<Option<Job>> {
        let job_id = match &request.job_id {
            Some(job_id) => job_id.clone(),
            None => match self.wait.pop_back() {
                Some(job_id) => {
                    self.active.push_front(job_id.clone());
                    job_id
                }
                None => return Ok(None),
            },
        };

        if !self.jobs.contains_key(&job_id) {
            remove_one(&mut self.active, &job_id);
            return Ok(None);
        }

        if let Some(limiter) = &request.limiter {
            if let Some(due) = self.check_limiter(&job_id, limiter, now) {
                remove_one(&mut self.active, &job_id);
                self.priority.remove(&job_id);
                self.delayed
                    .insert(&job_id, delayed_score(due, id_sequence(&job_id)));
                self.set_field(&job_id, "delay", (due - request.now).max(0).to_string());
                self.emit(
                    event_name::DELAYED,
                    Some(&job_id),
                    vec![("delay", due.to_string())],
                );
                return Ok(None);
            }
        }

        self.locks.insert(
            job_id.clone(),
            Lease {
                token: request.token.clone(),
                expires_at: now + request.lease_ms as i64,
            },
        );
        self.priority.remove(&job_id);
        self.set_field(&job_id, "processedOn", request.now.to_string());
        self.emit(
            event_name::ACTIVE,
            Some(&job_id),
            vec![("prev", "waiting".to_string())],
        );
        self.load_job(&job_id)
    }

    fn finished_set(&mut self, completed: bool) -> &mut SortedSet {
        if completed {
            &mut self.completed
        } else {
            &mut self.failed
        }
    }
}

/// Mutex-guarded single-process implementation of [`AtomicStore`].
pub struct MemoryStore {
    queue: String,
    data: Mutex<QueueData>,
    job_ready: Notify,
    event_appended: Notify,
}

impl MemoryStore {
    pub fn new(queue: impl Into<String>, events_max_len: u64) -> Self {
        Self {
            queue: queue.into(),
            data: Mutex::new(QueueData {
                events_max_len,
                ..Default::default()
            }),
            job_ready: Notify::new(),
            event_appended: Notify::new(),
        }
    }

    fn data(&self) -> StoreResult<MutexGuard<'_, QueueData>> {
        self.data
            .lock()
            .map_err(|e| StoreError::Operation(e.to_string()))
    }

    fn notify(&self) {
        self.job_ready.notify_waiters();
        self.event_appended.notify_waiters();
    }

    /// Runs `f` under the lock and wakes blocked readers afterwards.
    fn mutate<T>(&self, f: impl FnOnce(&mut QueueData) -> StoreResult<T>) -> StoreResult<T> {
        let result = {
            let mut data = self.data()?;
            f(&mut *data)
        };
        self.notify();
        result
    }

    /// Lets the lease on `job_id` lapse as if its owner stopped renewing it.
    #[cfg(test)]
    pub(crate) fn expire_lease(&self, job_id: &str) {
        let mut data = self.data().unwrap();
        if let Some(lease) = data.locks.get_mut(job_id) {
            lease.expires_at = 0;
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, job: &Job) -> StoreResult<JobId> {
        let fields = job.to_hash()?;
        self.mutate(|data| {
            data.counter += 1;
            let counter = data.counter;
            let job_id = if job.id.is_empty() {
                counter.to_string()
            } else if data.jobs.contains_key(&job.id) {
                return Ok(job.id.clone());
            } else {
                job.id.clone()
            };

            data.jobs.insert(
                job_id.clone(),
                fields
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            );

            if job.delay > 0 {
                let due = job.due_at();
                data.delayed.insert(&job_id, delayed_score(due, counter));
                data.emit(
                    event_name::DELAYED,
                    Some(&job_id),
                    vec![("delay", due.to_string())],
                );
            } else {
                data.add_to_wait(&job_id, job.priority, job.opts.lifo);
                data.emit(event_name::WAITING, Some(&job_id), Vec::new());
            }
            Ok(job_id)
        })
    }

    async fn admit_next(&self, request: &AdmitRequest) -> StoreResult<Option<Job>> {
        self.mutate(|data| data.admit(request, now_ms()))
    }

    async fn wait_for_job(&self, timeout: Duration) -> StoreResult<Option<JobId>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut data = self.data()?;
                if let Some(job_id) = data.wait.pop_back() {
                    data.active.push_front(job_id.clone());
                    return Ok(Some(job_id));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn finalize(&self, request: &FinalizeRequest) -> StoreResult<Option<Job>> {
        self.mutate(|data| {
            let now = now_ms();
            let job_id = request.job_id.as_str();
            data.verify_lease(job_id, Some(&request.token), "finalize", now)?;

            let (completed, event, field, value) = match &request.outcome {
                Outcome::Completed { return_value } => (
                    true,
                    event_name::COMPLETED,
                    "returnvalue",
                    serde_json::to_string(return_value)?,
                ),
                Outcome::Failed(attempt) => {
                    data.apply_attempt(job_id, attempt)?;
                    (
                        false,
                        event_name::FAILED,
                        "failedReason",
                        attempt.failed_reason.clone(),
                    )
                }
            };
            data.emit(event, Some(job_id), vec![(field, value.clone())]);

            match request.retention {
                Retention::Remove => {
                    data.delete_job(job_id);
                }
                Retention::Keep | Retention::KeepLast(_) => {
                    data.finished_set(completed).insert(job_id, request.now);
                    data.set_field(job_id, field, value);
                    data.set_field(job_id, "finishedOn", request.now.to_string());
                    if let Retention::KeepLast(keep) = request.retention {
                        let stale: Vec<String> = data
                            .finished_set(completed)
                            .members_desc()
                            .into_iter()
                            .skip(keep as usize)
                            .collect();
                        for id in stale {
                            data.finished_set(completed).remove(&id);
                            data.delete_job(&id);
                        }
                    }
                }
            }

            match &request.fetch_next {
                Some(next) => {
                    let job = data.admit(next, now)?;
                    if job.is_none() && data.wait.is_empty() {
                        data.emit(event_name::DRAINED, None, Vec::new());
                    }
                    Ok(job)
                }
                None => Ok(None),
            }
        })
    }

    async fn move_to_delayed(&self, request: &DelayRequest) -> StoreResult<()> {
        self.mutate(|data| {
            let job_id = request.job_id.as_str();
            data.verify_lease(job_id, request.token.as_deref(), "move_to_delayed", now_ms())?;
            if let Some(attempt) = &request.attempt {
                data.apply_attempt(job_id, attempt)?;
            }
            data.delayed
                .insert(job_id, delayed_score(request.due, id_sequence(job_id)));
            data.set_field(
                job_id,
                "delay",
                (request.due - request.now).max(0).to_string(),
            );
            data.emit(
                event_name::DELAYED,
                Some(job_id),
                vec![("delay", request.due.to_string())],
            );
            Ok(())
        })
    }

    async fn requeue(&self, request: &RequeueRequest) -> StoreResult<()> {
        self.mutate(|data| {
            let job_id = request.job_id.as_str();
            data.verify_lease(job_id, Some(&request.token), "requeue", now_ms())?;
            data.apply_attempt(job_id, &request.attempt)?;
            let priority = data.priority_of(job_id);
            data.add_to_wait(job_id, priority, request.lifo);
            data.emit(
                event_name::WAITING,
                Some(job_id),
                vec![("prev", "failed".to_string())],
            );
            Ok(())
        })
    }

    async fn promote_delayed(&self, now: i64, limit: usize) -> StoreResult<Promotion> {
        self.mutate(|data| {
            let max_score = delayed_score(now + 1, 0) - 1;
            let due = data.delayed.range_to(max_score, limit);
            let mut promoted = 0;
            for job_id in due {
                data.delayed.remove(&job_id);
                if !data.jobs.contains_key(&job_id) {
                    continue;
                }
                let priority = data.priority_of(&job_id);
                data.add_to_wait(&job_id, priority, false);
                data.set_field(&job_id, "delay", "0".to_string());
                data.emit(
                    event_name::WAITING,
                    Some(&job_id),
                    vec![("prev", "delayed".to_string())],
                );
                promoted += 1;
            }
            Ok(Promotion {
                promoted,
                next_due: data.delayed.first().map(due_from_score),
            })
        })
    }

    async fn promote_job(&self, job_id: &str) -> StoreResult<bool> {
        self.mutate(|data| {
            if !data.delayed.remove(job_id) {
                return Ok(false);
            }
            let priority = data.priority_of(job_id);
            data.add_to_wait(job_id, priority, false);
            data.set_field(job_id, "delay", "0".to_string());
            data.emit(
                event_name::WAITING,
                Some(job_id),
                vec![("prev", "delayed".to_string())],
            );
            Ok(true)
        })
    }

    async fn extend_lease(&self, job_id: &str, token: &str, lease_ms: u64) -> StoreResult<bool> {
        let mut data = self.data()?;
        let now = now_ms();
        if data.lock_owner(job_id, now) != Some(token) {
            return Ok(false);
        }
        if let Some(lease) = data.locks.get_mut(job_id) {
            lease.expires_at = now + lease_ms as i64;
        }
        data.stalled.remove(job_id);
        Ok(true)
    }

    async fn reap_stalled(
        &self,
        max_stalled: u32,
        now: i64,
        interval_ms: u64,
    ) -> StoreResult<StalledReport> {
        self.mutate(|data| {
            let wall = now_ms();
            let mut report = StalledReport::default();
            if data.stalled_check_until > wall {
                return Ok(report);
            }
            data.stalled_check_until = wall + interval_ms as i64;

            let candidates: Vec<String> = data.stalled.drain().collect();
            for job_id in candidates {
                if data.lock_owner(&job_id, wall).is_some() {
                    continue;
                }
                if !remove_one(&mut data.active, &job_id) || !data.jobs.contains_key(&job_id) {
                    continue;
                }
                data.locks.remove(&job_id);
                let count = data
                    .field(&job_id, "stalledCounter")
                    .and_then(|c| c.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                data.set_field(&job_id, "stalledCounter", count.to_string());

                if count > max_stalled {
                    data.failed.insert(&job_id, now);
                    data.set_field(&job_id, "failedReason", STALLED_FAILURE_REASON.to_string());
                    data.set_field(&job_id, "finishedOn", now.to_string());
                    data.emit(
                        event_name::FAILED,
                        Some(&job_id),
                        vec![("failedReason", STALLED_FAILURE_REASON.to_string())],
                    );
                    report.failed.push(job_id);
                } else {
                    data.intake().push_back(job_id.clone());
                    data.emit(event_name::STALLED, Some(&job_id), Vec::new());
                    report.stalled.push(job_id);
                }
            }

            data.stalled = data.active.iter().cloned().collect();
            Ok(report)
        })
    }

    async fn remove(&self, job_id: &str) -> StoreResult<bool> {
        self.mutate(|data| {
            if data.lock_owner(job_id, now_ms()).is_some() {
                return Err(StoreError::JobIsActive {
                    job_id: job_id.to_string(),
                });
            }
            remove_one(&mut data.wait, job_id);
            remove_one(&mut data.paused_list, job_id);
            remove_one(&mut data.active, job_id);
            data.delayed.remove(job_id);
            data.priority.remove(job_id);
            data.completed.remove(job_id);
            data.failed.remove(job_id);
            data.stalled.remove(job_id);
            let existed = data.delete_job(job_id);
            if existed {
                data.emit(event_name::REMOVED, Some(job_id), Vec::new());
            }
            Ok(existed)
        })
    }

    async fn pause(&self, paused: bool) -> StoreResult<()> {
        self.mutate(|data| {
            if paused && !data.paused {
                let waiting = std::mem::take(&mut data.wait);
                data.paused_list.extend(waiting);
                data.paused = true;
                data.emit(event_name::PAUSED, None, Vec::new());
            } else if !paused && data.paused {
                let waiting = std::mem::take(&mut data.paused_list);
                data.wait.extend(waiting);
                data.paused = false;
                data.emit(event_name::RESUMED, None, Vec::new());
            }
            Ok(())
        })
    }

    async fn is_paused(&self) -> StoreResult<bool> {
        Ok(self.data()?.paused)
    }

    async fn retry(&self, job_id: &str, expected: JobState, lifo: bool) -> StoreResult<()> {
        self.mutate(|data| {
            if !data.jobs.contains_key(job_id) {
                return Err(StoreError::JobNotFound {
                    job_id: job_id.to_string(),
                });
            }
            if data.lock_owner(job_id, now_ms()).is_some() {
                return Err(StoreError::JobIsActive {
                    job_id: job_id.to_string(),
                });
            }
            let removed = match expected {
                JobState::Completed => data.completed.remove(job_id),
                JobState::Failed => data.failed.remove(job_id),
                _ => false,
            };
            if !removed {
                return Err(StoreError::JobNotInState {
                    job_id: job_id.to_string(),
                    state: expected,
                });
            }
            if let Some(hash) = data.jobs.get_mut(job_id) {
                for field in ["finishedOn", "processedOn", "failedReason", "returnvalue"] {
                    hash.remove(field);
                }
            }
            let priority = data.priority_of(job_id);
            data.add_to_wait(job_id, priority, lifo);
            data.emit(
                event_name::WAITING,
                Some(job_id),
                vec![("prev", expected.to_string())],
            );
            Ok(())
        })
    }

    async fn update_progress(&self, job_id: &str, progress: &JsonValue) -> StoreResult<()> {
        let encoded = serde_json::to_string(progress)?;
        self.mutate(|data| {
            if !data.jobs.contains_key(job_id) {
                return Err(StoreError::MissingJobKey {
                    job_id: job_id.to_string(),
                    command: "update_progress".to_string(),
                });
            }
            data.set_field(job_id, "progress", encoded.clone());
            data.emit(event_name::PROGRESS, Some(job_id), vec![("data", encoded)]);
            Ok(())
        })
    }

    async fn add_log(&self, job_id: &str, line: &str) -> StoreResult<u64> {
        let mut data = self.data()?;
        if !data.jobs.contains_key(job_id) {
            return Err(StoreError::MissingJobKey {
                job_id: job_id.to_string(),
                command: "add_log".to_string(),
            });
        }
        let logs = data.logs.entry(job_id.to_string()).or_default();
        logs.push(line.to_string());
        Ok(logs.len() as u64)
    }

    async fn logs(&self, job_id: &str) -> StoreResult<Vec<String>> {
        Ok(self.data()?.logs.get(job_id).cloned().unwrap_or_default())
    }

    async fn clean(
        &self,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        self.mutate(|data| {
            let members: Vec<String> = match state {
                JobState::Completed => data.completed.members(),
                JobState::Failed => data.failed.members(),
                JobState::Delayed => data.delayed.members(),
                JobState::Waiting => data.wait.iter().cloned().collect(),
                JobState::Paused => data.paused_list.iter().cloned().collect(),
                JobState::Active => data.active.iter().cloned().collect(),
                JobState::Unknown => {
                    return Err(StoreError::Operation(
                        "cannot clean jobs in the unknown state".to_string(),
                    ));
                }
            };

            let now = now_ms();
            let mut removed = Vec::new();
            for job_id in members {
                if limit > 0 && removed.len() >= limit {
                    break;
                }
                if data.lock_owner(&job_id, now).is_some() {
                    continue;
                }
                let timestamp = data
                    .field(&job_id, "finishedOn")
                    .or_else(|| data.field(&job_id, "timestamp"))
                    .and_then(|t| t.parse::<i64>().ok());
                if timestamp.is_some_and(|t| t > older_than) {
                    continue;
                }
                match state {
                    JobState::Completed => {
                        data.completed.remove(&job_id);
                    }
                    JobState::Failed => {
                        data.failed.remove(&job_id);
                    }
                    JobState::Delayed => {
                        data.delayed.remove(&job_id);
                    }
                    JobState::Waiting => {
                        remove_one(&mut data.wait, &job_id);
                    }
                    JobState::Paused => {
                        remove_one(&mut data.paused_list, &job_id);
                    }
                    JobState::Active => {
                        remove_one(&mut data.active, &job_id);
                    }
                    JobState::Unknown => {}
                }
                data.priority.remove(&job_id);
                data.delete_job(&job_id);
                removed.push(job_id);
            }

            if !removed.is_empty() {
                data.emit(
                    event_name::CLEANED,
                    None,
                    vec![("count", removed.len().to_string())],
                );
            }
            Ok(removed)
        })
    }

    async fn drain(&self, include_delayed: bool) -> StoreResult<u64> {
        self.mutate(|data| {
            let mut ids: Vec<String> = data.wait.drain(..).collect();
            ids.extend(data.paused_list.drain(..));
            if include_delayed {
                ids.extend(data.delayed.members());
                data.delayed = SortedSet::default();
            }
            data.priority = SortedSet::default();
            for job_id in &ids {
                data.delete_job(job_id);
            }
            Ok(ids.len() as u64)
        })
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        self.data()?.load_job(job_id)
    }

    async fn get_state(&self, job_id: &str) -> StoreResult<JobState> {
        let data = self.data()?;
        let state = if data.completed.contains(job_id) {
            JobState::Completed
        } else if data.failed.contains(job_id) {
            JobState::Failed
        } else if data.delayed.contains(job_id) {
            JobState::Delayed
        } else if data.active.iter().any(|id| id == job_id) {
            JobState::Active
        } else if data.wait.iter().any(|id| id == job_id) {
            JobState::Waiting
        } else if data.paused_list.iter().any(|id| id == job_id) {
            JobState::Paused
        } else {
            JobState::Unknown
        };
        Ok(state)
    }

    async fn count(&self, state: JobState) -> StoreResult<u64> {
        let data = self.data()?;
        let count = match state {
            JobState::Waiting => data.wait.len(),
            JobState::Paused => data.paused_list.len(),
            JobState::Active => data.active.len(),
            JobState::Delayed => data.delayed.len(),
            JobState::Completed => data.completed.len(),
            JobState::Failed => data.failed.len(),
            JobState::Unknown => 0,
        };
        Ok(count as u64)
    }

    async fn delayed_jobs(&self) -> StoreResult<Vec<(JobId, i64)>> {
        Ok(self
            .data()?
            .delayed
            .entries()
            .into_iter()
            .map(|(job_id, score)| (job_id, due_from_score(score)))
            .collect())
    }

    async fn last_event_id(&self) -> StoreResult<Option<EventId>> {
        Ok(self.data()?.events.back().map(|record| record.id))
    }

    async fn read_events(
        &self,
        after: EventId,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<EventRecord>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.event_appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let data = self.data()?;
                let records: Vec<EventRecord> = data
                    .events
                    .iter()
                    .filter(|record| record.id > after)
                    .take(count)
                    .cloned()
                    .collect();
                if !records.is_empty() || block.is_zero() {
                    return Ok(records);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn trim_events(&self, max_len: u64) -> StoreResult<u64> {
        let mut data = self.data()?;
        let mut trimmed = 0;
        while data.events.len() as u64 > max_len {
            data.events.pop_front();
            trimmed += 1;
        }
        Ok(trimmed)
    }

    async fn upsert_repeatable(&self, key: &str, next_millis: i64) -> StoreResult<()> {
        self.data()?.repeat.insert(key, next_millis);
        Ok(())
    }

    async fn repeatable_next(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self.data()?.repeat.score(key))
    }

    async fn remove_repeatable(&self, key: &str) -> StoreResult<bool> {
        Ok(self.data()?.repeat.remove(key))
    }

    async fn repeatables(&self) -> StoreResult<Vec<(String, i64)>> {
        Ok(self.data()?.repeat.entries())
    }
}
