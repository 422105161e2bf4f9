//! Redis store using a bb8 connection pool and server-side scripts.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, FromRedisValue, RedisError, Script, ScriptInvocation, Value};
use serde_json::Value as JsonValue;

use crate::config::settings::RedisStoreConfig;
use crate::jobs::{Job, JobId, JobState, Retention, due_from_score};
use crate::store::keys::QueueKeys;
use crate::store::scripts::QueueScripts;
use crate::store::types::{
    AdmitRequest, AttemptRecord, DelayRequest, EventId, EventRecord, FinalizeRequest, Outcome,
    Promotion, RequeueRequest, StalledReport,
};
use crate::store::{AtomicStore, StoreError, StoreResult};

type RedisPool = Pool<Client>;

/// Longest single server-side block. Longer waits are issued as several
/// blocking calls so one call never outlives the client's response timeout.
const MAX_BLOCK: Duration = Duration::from_millis(250);

/// Redis-backed store. Every state transition is one script invocation.
pub struct RedisStore {
    pool: RedisPool,
    queue: String,
    keys: QueueKeys,
    events_max_len: u64,
    scripts: QueueScripts,
}

impl RedisStore {
    pub async fn new(
        config: &RedisStoreConfig,
        queue: &str,
        events_max_len: u64,
    ) -> StoreResult<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout))
            .build(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            queue: queue.to_string(),
            keys: QueueKeys::new(&config.key_prefix, queue),
            events_max_len,
            scripts: QueueScripts::load(),
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn get_conn(&self) -> StoreResult<PooledConnection<'_, Client>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Starts an invocation with the queue keys and the shared leading arguments.
    fn invocation<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.script_keys() {
            invocation.key(key);
        }
        invocation.arg(self.keys.base()).arg(self.events_max_len);
        invocation
    }

    async fn run<T: FromRedisValue + Send>(
        &self,
        invocation: &ScriptInvocation<'_>,
        operation: &str,
    ) -> StoreResult<T> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        invocation
            .invoke_async(conn_ref)
            .await
            .map_err(|e| map_redis_error(e, operation))
    }
}

fn map_redis_error(error: RedisError, operation: &str) -> StoreError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        StoreError::Connection(format!("{}: {}", operation, error))
    } else {
        StoreError::Operation(format!("{}: {}", operation, error))
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        Value::Int(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(value_string).collect(),
        _ => Vec::new(),
    }
}

/// Parses the `{jobId, HGETALL}` reply of an admission.
fn admitted_job(value: &Value) -> StoreResult<Option<Job>> {
    match value {
        Value::Array(items) if items.len() == 2 => {
            let job_id = value_string(&items[0]).ok_or_else(|| {
                StoreError::Serialization("admission reply without job id".to_string())
            })?;
            Ok(Some(Job::from_flat(&job_id, value_strings(&items[1]))?))
        }
        _ => Ok(None),
    }
}

fn status_code(value: &Value) -> Option<i64> {
    match value {
        Value::Int(code) => Some(*code),
        _ => None,
    }
}

fn push_admit_args(invocation: &mut ScriptInvocation<'_>, request: &AdmitRequest) {
    let (max, duration, group_key) = match &request.limiter {
        Some(limiter) => (
            limiter.max,
            limiter.duration_ms,
            limiter.group_key.clone().unwrap_or_default(),
        ),
        None => (0, 0, String::new()),
    };
    invocation
        .arg(&request.token)
        .arg(request.lease_ms)
        .arg(request.job_id.as_deref().unwrap_or(""))
        .arg(max)
        .arg(duration)
        .arg(group_key)
        .arg(request.now);
}

fn push_attempt_args(
    invocation: &mut ScriptInvocation<'_>,
    attempt: Option<&AttemptRecord>,
) -> StoreResult<()> {
    match attempt {
        Some(attempt) => {
            invocation
                .arg(attempt.attempts_made)
                .arg(&attempt.failed_reason)
                .arg(serde_json::to_string(&attempt.stacktrace)?);
        }
        None => {
            invocation.arg("").arg("").arg("[]");
        }
    }
    Ok(())
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn event_record(id: &str, map: &HashMap<String, Value>) -> StoreResult<EventRecord> {
    let mut fields: HashMap<String, String> = map
        .iter()
        .filter_map(|(k, v)| value_string(v).map(|v| (k.clone(), v)))
        .collect();
    let name = fields.remove("event").unwrap_or_default();
    let job_id = fields.remove("jobId");
    Ok(EventRecord {
        id: id.parse()?,
        name,
        job_id,
        fields,
    })
}

#[async_trait]
impl AtomicStore for RedisStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, job: &Job) -> StoreResult<JobId> {
        let mut invocation = self.invocation(&self.scripts.enqueue);
        invocation
            .arg(&job.id)
            .arg(job.timestamp)
            .arg(job.delay)
            .arg(job.priority)
            .arg(flag(job.opts.lifo));
        for (field, value) in job.to_hash()? {
            invocation.arg(field).arg(value);
        }
        self.run(&invocation, "enqueue").await
    }

    async fn admit_next(&self, request: &AdmitRequest) -> StoreResult<Option<Job>> {
        let mut invocation = self.invocation(&self.scripts.admit);
        push_admit_args(&mut invocation, request);
        let reply: Value = self.run(&invocation, "admit").await?;
        admitted_job(&reply)
    }

    async fn wait_for_job(&self, timeout: Duration) -> StoreResult<Option<JobId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let block = remaining.min(MAX_BLOCK).as_secs_f64().max(0.001);

            let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
            let conn_ref: &mut MultiplexedConnection = &mut conn;
            let job_id: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.keys.wait)
                .arg(&self.keys.active)
                .arg(block)
                .query_async(conn_ref)
                .await
                .map_err(|e| map_redis_error(e, "wait_for_job"))?;
            if job_id.is_some() {
                return Ok(job_id);
            }
        }
    }

    async fn finalize(&self, request: &FinalizeRequest) -> StoreResult<Option<Job>> {
        let mut invocation = self.invocation(&self.scripts.finalize);
        invocation.arg(&request.job_id).arg(&request.token);
        match &request.outcome {
            Outcome::Completed { return_value } => {
                invocation
                    .arg("completed")
                    .arg(serde_json::to_string(return_value)?)
                    .arg("")
                    .arg("[]");
            }
            Outcome::Failed(attempt) => {
                invocation
                    .arg("failed")
                    .arg(&attempt.failed_reason)
                    .arg(attempt.attempts_made)
                    .arg(serde_json::to_string(&attempt.stacktrace)?);
            }
        }
        let retention = match request.retention {
            Retention::Keep => "keep".to_string(),
            Retention::Remove => "remove".to_string(),
            Retention::KeepLast(count) => count.to_string(),
        };
        invocation
            .arg(retention)
            .arg(request.now)
            .arg(flag(request.fetch_next.is_some()));
        if let Some(next) = &request.fetch_next {
            push_admit_args(&mut invocation, next);
        }

        let reply: Value = self.run(&invocation, "finalize").await?;
        if let Some(code) = status_code(&reply) {
            if let Some(error) = StoreError::from_code(code, &request.job_id, "finalize") {
                return Err(error);
            }
            return Ok(None);
        }
        admitted_job(&reply)
    }

    async fn move_to_delayed(&self, request: &DelayRequest) -> StoreResult<()> {
        let mut invocation = self.invocation(&self.scripts.move_to_delayed);
        invocation
            .arg(&request.job_id)
            .arg(request.due)
            .arg(request.token.as_deref().unwrap_or(""));
        push_attempt_args(&mut invocation, request.attempt.as_ref())?;
        invocation.arg(request.now);

        let code: i64 = self.run(&invocation, "move_to_delayed").await?;
        match StoreError::from_code(code, &request.job_id, "move_to_delayed") {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn requeue(&self, request: &RequeueRequest) -> StoreResult<()> {
        let mut invocation = self.invocation(&self.scripts.requeue);
        invocation
            .arg(&request.job_id)
            .arg(&request.token)
            .arg(flag(request.lifo));
        push_attempt_args(&mut invocation, Some(&request.attempt))?;

        let code: i64 = self.run(&invocation, "requeue").await?;
        match StoreError::from_code(code, &request.job_id, "requeue") {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn promote_delayed(&self, now: i64, limit: usize) -> StoreResult<Promotion> {
        let mut invocation = self.invocation(&self.scripts.promote_delayed);
        invocation.arg(now).arg(limit);
        let (promoted, next_due): (u64, i64) = self.run(&invocation, "promote_delayed").await?;
        Ok(Promotion {
            promoted,
            next_due: (next_due >= 0).then_some(next_due),
        })
    }

    async fn promote_job(&self, job_id: &str) -> StoreResult<bool> {
        let mut invocation = self.invocation(&self.scripts.promote_job);
        invocation.arg(job_id);
        let promoted: i64 = self.run(&invocation, "promote_job").await?;
        Ok(promoted == 1)
    }

    async fn extend_lease(&self, job_id: &str, token: &str, lease_ms: u64) -> StoreResult<bool> {
        let mut invocation = self.invocation(&self.scripts.extend_lease);
        invocation.arg(job_id).arg(token).arg(lease_ms);
        let extended: i64 = self.run(&invocation, "extend_lease").await?;
        Ok(extended == 1)
    }

    async fn reap_stalled(
        &self,
        max_stalled: u32,
        now: i64,
        interval_ms: u64,
    ) -> StoreResult<StalledReport> {
        let mut invocation = self.invocation(&self.scripts.reap_stalled);
        invocation.arg(max_stalled).arg(now).arg(interval_ms);
        let (stalled, failed): (Vec<String>, Vec<String>) =
            self.run(&invocation, "reap_stalled").await?;
        Ok(StalledReport { stalled, failed })
    }

    async fn remove(&self, job_id: &str) -> StoreResult<bool> {
        let mut invocation = self.invocation(&self.scripts.remove);
        invocation.arg(job_id);
        let code: i64 = self.run(&invocation, "remove").await?;
        if code < 0 {
            return Err(StoreError::JobIsActive {
                job_id: job_id.to_string(),
            });
        }
        Ok(code == 1)
    }

    async fn pause(&self, paused: bool) -> StoreResult<()> {
        let mut invocation = self.invocation(&self.scripts.pause);
        invocation.arg(flag(paused));
        let _: i64 = self.run(&invocation, "pause").await?;
        Ok(())
    }

    async fn is_paused(&self) -> StoreResult<bool> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        conn_ref
            .hexists(&self.keys.meta, "paused")
            .await
            .map_err(|e| map_redis_error(e, "is_paused"))
    }

    async fn retry(&self, job_id: &str, expected: JobState, lifo: bool) -> StoreResult<()> {
        let mut invocation = self.invocation(&self.scripts.retry);
        invocation.arg(job_id).arg(expected.as_str()).arg(flag(lifo));
        let code: i64 = self.run(&invocation, "retry").await?;
        match StoreError::from_retry_code(code, job_id, expected) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn update_progress(&self, job_id: &str, progress: &JsonValue) -> StoreResult<()> {
        let mut invocation = self.invocation(&self.scripts.update_progress);
        invocation.arg(job_id).arg(serde_json::to_string(progress)?);
        let code: i64 = self.run(&invocation, "update_progress").await?;
        match StoreError::from_code(code, job_id, "update_progress") {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn add_log(&self, job_id: &str, line: &str) -> StoreResult<u64> {
        let mut invocation = self.invocation(&self.scripts.add_log);
        invocation.arg(job_id).arg(line);
        let count: i64 = self.run(&invocation, "add_log").await?;
        match StoreError::from_code(count, job_id, "add_log") {
            Some(error) => Err(error),
            None => Ok(count as u64),
        }
    }

    async fn logs(&self, job_id: &str) -> StoreResult<Vec<String>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        conn_ref
            .lrange(self.keys.logs(job_id), 0, -1)
            .await
            .map_err(|e| map_redis_error(e, "logs"))
    }

    async fn clean(
        &self,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        let mut invocation = self.invocation(&self.scripts.clean);
        invocation.arg(state.as_str()).arg(older_than).arg(limit);
        self.run(&invocation, "clean").await
    }

    async fn drain(&self, include_delayed: bool) -> StoreResult<u64> {
        let mut invocation = self.invocation(&self.scripts.drain);
        invocation.arg(flag(include_delayed));
        self.run(&invocation, "drain").await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let hash: HashMap<String, String> = conn_ref
            .hgetall(self.keys.job(job_id))
            .await
            .map_err(|e| map_redis_error(e, "get_job"))?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(job_id, &hash)?))
    }

    async fn get_state(&self, job_id: &str) -> StoreResult<JobState> {
        let mut invocation = self.invocation(&self.scripts.get_state);
        invocation.arg(job_id);
        let state: String = self.run(&invocation, "get_state").await?;
        Ok(state.parse().unwrap_or(JobState::Unknown))
    }

    async fn count(&self, state: JobState) -> StoreResult<u64> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let result: Result<u64, RedisError> = match state {
            JobState::Waiting => conn_ref.llen(&self.keys.wait).await,
            JobState::Paused => conn_ref.llen(&self.keys.paused).await,
            JobState::Active => conn_ref.llen(&self.keys.active).await,
            JobState::Delayed => conn_ref.zcard(&self.keys.delayed).await,
            JobState::Completed => conn_ref.zcard(&self.keys.completed).await,
            JobState::Failed => conn_ref.zcard(&self.keys.failed).await,
            JobState::Unknown => return Ok(0),
        };
        result.map_err(|e| map_redis_error(e, "count"))
    }

    async fn delayed_jobs(&self) -> StoreResult<Vec<(JobId, i64)>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let entries: Vec<(String, f64)> = conn_ref
            .zrange_withscores(&self.keys.delayed, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, "delayed_jobs"))?;
        Ok(entries
            .into_iter()
            .map(|(job_id, score)| (job_id, due_from_score(score as i64)))
            .collect())
    }

    async fn last_event_id(&self) -> StoreResult<Option<EventId>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let reply: StreamRangeReply = conn_ref
            .xrevrange_count(&self.keys.events, "+", "-", 1)
            .await
            .map_err(|e| map_redis_error(e, "last_event_id"))?;
        match reply.ids.first() {
            Some(entry) => Ok(Some(entry.id.parse()?)),
            None => Ok(None),
        }
    }

    async fn read_events(
        &self,
        after: EventId,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<EventRecord>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let mut options = StreamReadOptions::default().count(count);
            if !remaining.is_zero() {
                options = options.block(remaining.min(MAX_BLOCK).as_millis().max(1) as usize);
            }

            let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
            let conn_ref: &mut MultiplexedConnection = &mut conn;
            let reply: Option<StreamReadReply> = conn_ref
                .xread_options(&[&self.keys.events], &[after.to_string()], &options)
                .await
                .map_err(|e| map_redis_error(e, "read_events"))?;

            let mut records = Vec::new();
            if let Some(reply) = reply {
                for stream in reply.keys {
                    for entry in stream.ids {
                        records.push(event_record(&entry.id, &entry.map)?);
                    }
                }
            }
            if !records.is_empty() || remaining.is_zero() {
                return Ok(records);
            }
        }
    }

    async fn trim_events(&self, max_len: u64) -> StoreResult<u64> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        redis::cmd("XTRIM")
            .arg(&self.keys.events)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(conn_ref)
            .await
            .map_err(|e| map_redis_error(e, "trim_events"))
    }

    async fn upsert_repeatable(&self, key: &str, next_millis: i64) -> StoreResult<()> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        conn_ref
            .zadd::<_, _, _, ()>(&self.keys.repeat, key, next_millis)
            .await
            .map_err(|e| map_redis_error(e, "upsert_repeatable"))
    }

    async fn repeatable_next(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let score: Option<f64> = conn_ref
            .zscore(&self.keys.repeat, key)
            .await
            .map_err(|e| map_redis_error(e, "repeatable_next"))?;
        Ok(score.map(|s| s as i64))
    }

    async fn remove_repeatable(&self, key: &str) -> StoreResult<bool> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let removed: i64 = conn_ref
            .zrem(&self.keys.repeat, key)
            .await
            .map_err(|e| map_redis_error(e, "remove_repeatable"))?;
        Ok(removed == 1)
    }

    async fn repeatables(&self) -> StoreResult<Vec<(String, i64)>> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;
        let entries: Vec<(String, f64)> = conn_ref
            .zrange_withscores(&self.keys.repeat, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, "repeatables"))?;
        Ok(entries
            .into_iter()
            .map(|(key, score)| (key, score as i64))
            .collect())
    }
}
