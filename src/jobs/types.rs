use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::options::JobOptions;
use crate::utils::now_ms;

pub type JobId = String;

/// Low bits of the delayed score reserved for the FIFO tie-break.
pub const DELAY_TIE_BITS: i64 = 0x1000;

/// Packs a due timestamp and a job sequence number into one sortable score.
///
/// Jobs due in the same millisecond are ordered by the low 12 bits of their
/// sequence number; ordering across a wrap of those bits is not preserved.
pub fn delayed_score(due_ms: i64, sequence: u64) -> i64 {
    due_ms * DELAY_TIE_BITS + (sequence & 0xfff) as i64
}

/// Inverse of [`delayed_score`] for the timestamp part.
pub fn due_from_score(score: i64) -> i64 {
    score.div_euclid(DELAY_TIE_BITS)
}

/// Numeric part of a job id used for the tie-break, 0 for custom ids.
pub fn id_sequence(job_id: &str) -> u64 {
    job_id.parse().unwrap_or(0)
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Paused,
    Delayed,
    Active,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Paused => "paused",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" | "wait" => Ok(JobState::Waiting),
            "paused" => Ok(JobState::Paused),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "unknown" => Ok(JobState::Unknown),
            _ => Err(JobError::InvalidOptions(format!(
                "Invalid job state '{}'. Valid states are: waiting, paused, delayed, active, completed, failed",
                s
            ))),
        }
    }
}

/// A unit of work and everything the store records about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub data: JsonValue,
    pub opts: JobOptions,
    pub timestamp: i64,
    pub delay: u64,
    pub priority: u32,
    pub progress: JsonValue,
    pub attempts_made: u32,
    pub stalled_counter: u32,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    #[serde(rename = "returnvalue")]
    pub return_value: Option<JsonValue>,
}

impl Job {
    /// Builds a not-yet-stored job. The id is the custom id when one is set,
    /// otherwise it is assigned by the store on enqueue.
    pub fn new(name: impl Into<String>, data: JsonValue, opts: JobOptions) -> Self {
        let timestamp = opts.timestamp.unwrap_or_else(now_ms);
        Self {
            id: opts.job_id.clone().unwrap_or_default(),
            name: name.into(),
            data,
            timestamp,
            delay: opts.delay.unwrap_or(0),
            priority: opts.priority.unwrap_or(0),
            opts,
            progress: JsonValue::from(0),
            attempts_made: 0,
            stalled_counter: 0,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            return_value: None,
        }
    }

    /// Due time of a delayed job.
    pub fn due_at(&self) -> i64 {
        self.timestamp + self.delay as i64
    }

    /// Appends a stacktrace then keeps the first `limit` entries.
    ///
    /// Once the cap is reached newer traces are the ones dropped.
    pub fn push_stacktrace(&mut self, trace: String) {
        self.stacktrace.push(trace);
        if let Some(limit) = self.opts.stack_trace_limit {
            self.stacktrace.truncate(limit);
        }
    }

    /// Flat field/value form written to the store's job hash.
    pub fn to_hash(&self) -> JobResult<Vec<(&'static str, String)>> {
        let mut fields = vec![
            ("name", self.name.clone()),
            ("data", serde_json::to_string(&self.data)?),
            ("opts", serde_json::to_string(&self.opts)?),
            ("timestamp", self.timestamp.to_string()),
            ("delay", self.delay.to_string()),
            ("priority", self.priority.to_string()),
            ("progress", serde_json::to_string(&self.progress)?),
            ("attemptsMade", self.attempts_made.to_string()),
            ("stalledCounter", self.stalled_counter.to_string()),
        ];
        if let Some(processed_on) = self.processed_on {
            fields.push(("processedOn", processed_on.to_string()));
        }
        if let Some(finished_on) = self.finished_on {
            fields.push(("finishedOn", finished_on.to_string()));
        }
        if let Some(reason) = &self.failed_reason {
            fields.push(("failedReason", reason.clone()));
        }
        if !self.stacktrace.is_empty() {
            fields.push(("stacktrace", serde_json::to_string(&self.stacktrace)?));
        }
        if let Some(value) = &self.return_value {
            fields.push(("returnvalue", serde_json::to_string(value)?));
        }
        if let Some(key) = &self.opts.rate_limiter_key {
            fields.push(("rlk", key.clone()));
        }
        Ok(fields)
    }

    /// Rebuilds a job from its stored hash.
    pub fn from_hash(id: &str, hash: &HashMap<String, String>) -> JobResult<Self> {
        let opts: JobOptions = match hash.get("opts") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| JobError::decode("opts", e.to_string()))?,
            None => JobOptions::default(),
        };

        Ok(Self {
            id: id.to_string(),
            name: hash.get("name").cloned().unwrap_or_default(),
            data: json_field(hash, "data")?.unwrap_or(JsonValue::Null),
            opts,
            timestamp: number_field(hash, "timestamp")?.unwrap_or(0),
            delay: number_field(hash, "delay")?.unwrap_or(0),
            priority: number_field(hash, "priority")?.unwrap_or(0),
            progress: json_field(hash, "progress")?.unwrap_or(JsonValue::from(0)),
            attempts_made: number_field(hash, "attemptsMade")?.unwrap_or(0),
            stalled_counter: number_field(hash, "stalledCounter")?.unwrap_or(0),
            processed_on: number_field(hash, "processedOn")?,
            finished_on: number_field(hash, "finishedOn")?,
            failed_reason: hash.get("failedReason").cloned(),
            stacktrace: json_field(hash, "stacktrace")?.unwrap_or_default(),
            return_value: json_field(hash, "returnvalue")?,
        })
    }

    /// Builds a job from the flat `[field, value, ...]` reply of a hash read.
    pub fn from_flat(id: &str, flat: Vec<String>) -> JobResult<Self> {
        let mut hash = HashMap::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            hash.insert(field, value);
        }
        Self::from_hash(id, &hash)
    }
}

fn json_field<T: serde::de::DeserializeOwned>(
    hash: &HashMap<String, String>,
    field: &str,
) -> JobResult<Option<T>> {
    match hash.get(field) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| JobError::decode(field, e.to_string())),
        _ => Ok(None),
    }
}

fn number_field<T: FromStr>(hash: &HashMap<String, String>, field: &str) -> JobResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match hash.get(field) {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| JobError::decode(field, e.to_string())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::backoff::BackoffSpec;
    use crate::jobs::options::{Retention, RepeatOptions};
    use proptest::prelude::*;
    use serde_json::json;

    fn hash_of(job: &Job) -> HashMap<String, String> {
        job.to_hash()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_job_hash_roundtrip_preserves_identity() {
        let opts = JobOptions::default()
            .with_attempts(3)
            .with_backoff(BackoffSpec::exponential(1000))
            .with_delay(250)
            .with_repeat(RepeatOptions::cron("*/5 * * * *"));
        let mut job = Job::new("email", json!({"to": "a@example.com", "n": [1, 2]}), opts);
        job.id = "42".to_string();
        job.processed_on = Some(job.timestamp + 10);
        job.finished_on = Some(job.timestamp + 20);
        job.failed_reason = Some("boom".to_string());
        job.stacktrace = vec!["trace 1".to_string()];
        job.return_value = Some(json!({"ok": true}));
        job.progress = json!(50);
        job.attempts_made = 2;

        let reloaded = Job::from_hash("42", &hash_of(&job)).unwrap();
        assert_eq!(reloaded, job);
    }

    #[test]
    fn test_job_from_flat() {
        let job = Job::new("a", json!(1), JobOptions::default());
        let flat: Vec<String> = job
            .to_hash()
            .unwrap()
            .into_iter()
            .flat_map(|(k, v)| [k.to_string(), v])
            .collect();
        let reloaded = Job::from_flat("7", flat).unwrap();
        assert_eq!(reloaded.id, "7");
        assert_eq!(reloaded.name, "a");
        assert_eq!(reloaded.timestamp, job.timestamp);
    }

    #[test]
    fn test_from_hash_reports_bad_field() {
        let mut hash = HashMap::new();
        hash.insert("name".to_string(), "x".to_string());
        hash.insert("attemptsMade".to_string(), "many".to_string());
        let err = Job::from_hash("1", &hash).unwrap_err();
        assert!(matches!(err, JobError::Decode { ref field, .. } if field == "attemptsMade"));
    }

    #[test]
    fn test_push_stacktrace_keeps_oldest() {
        let mut opts = JobOptions::default();
        opts.stack_trace_limit = Some(2);
        let mut job = Job::new("a", json!(null), opts);
        job.push_stacktrace("first".to_string());
        job.push_stacktrace("second".to_string());
        job.push_stacktrace("third".to_string());
        assert_eq!(job.stacktrace, vec!["first", "second"]);
    }

    #[test]
    fn test_retention_survives_hash() {
        let mut opts = JobOptions::default();
        opts.remove_on_complete = Some(Retention::KeepLast(10));
        let job = Job::new("a", json!(null), opts);
        let reloaded = Job::from_hash("1", &hash_of(&job)).unwrap();
        assert_eq!(reloaded.opts.completion_retention(), Retention::KeepLast(10));
    }

    #[test]
    fn test_job_state_parse_and_display() {
        assert_eq!("wait".parse::<JobState>().unwrap(), JobState::Waiting);
        assert_eq!("FAILED".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("nope".parse::<JobState>().is_err());
        assert_eq!(JobState::Delayed.to_string(), "delayed");
    }

    proptest! {
        #[test]
        fn property_delayed_score_orders_by_due_then_sequence(
            due in 1_600_000_000_000i64..1_900_000_000_000i64,
            a in 0u64..4096,
            b in 0u64..4096,
        ) {
            prop_assume!(a < b);
            prop_assert!(delayed_score(due, a) < delayed_score(due, b));
            prop_assert!(delayed_score(due, b) < delayed_score(due + 1, a));
            prop_assert_eq!(due_from_score(delayed_score(due, b)), due);
        }
    }
}
