//! Request and reply types of the atomic store operations.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::jobs::{JobId, Retention};
use crate::store::error::StoreError;

/// Reason recorded when a job exceeds the allowed number of stalls.
pub const STALLED_FAILURE_REASON: &str = "job stalled more than allowable limit";

/// Event names written to the event log.
pub mod event_name {
    pub const WAITING: &str = "waiting";
    pub const DELAYED: &str = "delayed";
    pub const ACTIVE: &str = "active";
    pub const PROGRESS: &str = "progress";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const STALLED: &str = "stalled";
    pub const REMOVED: &str = "removed";
    pub const PAUSED: &str = "paused";
    pub const RESUMED: &str = "resumed";
    pub const DRAINED: &str = "drained";
    pub const CLEANED: &str = "cleaned";
}

/// Rate limiter applied during admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSpec {
    /// Jobs admitted per window
    pub max: u64,
    /// Window length in milliseconds
    pub duration_ms: u64,
    /// Payload field whose value selects the bucket
    pub group_key: Option<String>,
}

/// Waiting → Active under a new lease.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub token: String,
    pub lease_ms: u64,
    /// Job already moved to the active list by a blocking claim
    pub job_id: Option<JobId>,
    pub limiter: Option<LimiterSpec>,
    pub now: i64,
}

/// Failure bookkeeping written together with a state move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempts_made: u32,
    pub failed_reason: String,
    pub stacktrace: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed { return_value: JsonValue },
    Failed(AttemptRecord),
}

/// Active → Completed/Failed.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub job_id: JobId,
    pub token: String,
    pub outcome: Outcome,
    pub retention: Retention,
    pub now: i64,
    /// Admit the next waiting job in the same transaction
    pub fetch_next: Option<AdmitRequest>,
}

/// Active (or any state) → Delayed.
#[derive(Debug, Clone)]
pub struct DelayRequest {
    pub job_id: JobId,
    pub due: i64,
    /// Lease to verify and release, if the job is active
    pub token: Option<String>,
    pub attempt: Option<AttemptRecord>,
    pub now: i64,
}

/// Active → Waiting for an immediate retry.
#[derive(Debug, Clone)]
pub struct RequeueRequest {
    pub job_id: JobId,
    pub token: String,
    pub lifo: bool,
    pub attempt: AttemptRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    pub promoted: u64,
    /// Due time of the earliest job still delayed
    pub next_due: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    /// Jobs moved back to waiting
    pub stalled: Vec<JobId>,
    /// Jobs failed for exceeding the stall limit
    pub failed: Vec<JobId>,
}

/// Position in the event log, `{millis}-{sequence}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId {
    pub millis: u64,
    pub sequence: u64,
}

impl EventId {
    pub const ZERO: EventId = EventId {
        millis: 0,
        sequence: 0,
    };

    pub fn new(millis: u64, sequence: u64) -> Self {
        Self { millis, sequence }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

impl FromStr for EventId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::Serialization(format!("Invalid event id '{}'", s));
        let (millis, sequence) = match s.split_once('-') {
            Some((millis, sequence)) => (millis, sequence),
            None => (s, "0"),
        };
        Ok(EventId {
            millis: millis.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: EventId,
    pub name: String,
    pub job_id: Option<JobId>,
    pub fields: HashMap<String, String>,
}

impl EventRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}
