//! Per-job options, stored as JSON in the job's `opts` field.

use serde::{Deserialize, Serialize};

use crate::jobs::backoff::BackoffSpec;
use crate::jobs::error::{JobError, JobResult};

/// Largest accepted priority value. Lower numbers are served first; 0 means
/// "no priority" and uses the plain FIFO/LIFO intake.
pub const MAX_PRIORITY: u32 = 2_097_152;

/// What to do with a job's record once it reaches a terminal state.
///
/// Serialized as `true` (remove), `false` (keep) or a number K (keep the
/// K most recent jobs of that terminal state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    #[default]
    Keep,
    Remove,
    KeepLast(u64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Flag(bool),
    Count(u64),
}

impl From<RetentionRepr> for Retention {
    fn from(repr: RetentionRepr) -> Self {
        match repr {
            RetentionRepr::Flag(true) => Retention::Remove,
            RetentionRepr::Flag(false) => Retention::Keep,
            RetentionRepr::Count(count) => Retention::KeepLast(count),
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(retention: Retention) -> Self {
        match retention {
            Retention::Keep => RetentionRepr::Flag(false),
            Retention::Remove => RetentionRepr::Flag(true),
            Retention::KeepLast(count) => RetentionRepr::Count(count),
        }
    }
}

/// Schedule of a repeatable job: either a cron pattern or a fixed interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatOptions {
    /// Cron pattern, five or six fields (seconds optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// IANA timezone the cron pattern is evaluated in, UTC when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,

    /// Fixed interval in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,

    /// Maximum number of occurrences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Occurrences generated so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// Scheduled fire time of the previous occurrence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_millis: Option<i64>,

    /// Custom id folded into the repeat key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            cron: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn every(interval_ms: u64) -> Self {
        Self {
            every: Some(interval_ms),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> JobResult<()> {
        match (&self.cron, self.every) {
            (Some(_), Some(_)) => Err(JobError::InvalidRepeat(
                "cron and every cannot both be set".to_string(),
            )),
            (None, None) => Err(JobError::InvalidRepeat(
                "either cron or every must be set".to_string(),
            )),
            (None, Some(0)) => Err(JobError::InvalidRepeat(
                "every must be greater than 0".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Options accepted when adding a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Custom job id. Adding a job whose id already exists is a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Creation timestamp override (epoch ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// Milliseconds to wait before the job becomes ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    /// Total number of attempts before the job fails for good
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,

    /// Insert at the head of the intake instead of the tail
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lifo: bool,

    /// Processing deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<Retention>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<Retention>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace_limit: Option<usize>,

    /// Explicit rate-limiter bucket, overrides the limiter's payload field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
}

impl JobOptions {
    /// Attempts allowed in total, at least one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    pub fn completion_retention(&self) -> Retention {
        self.remove_on_complete.unwrap_or_default()
    }

    pub fn failure_retention(&self) -> Retention {
        self.remove_on_fail.unwrap_or_default()
    }

    /// Fills every unset field from `defaults`.
    pub fn merged_with(mut self, defaults: &JobOptions) -> Self {
        self.job_id = self.job_id.or_else(|| defaults.job_id.clone());
        self.timestamp = self.timestamp.or(defaults.timestamp);
        self.priority = self.priority.or(defaults.priority);
        self.delay = self.delay.or(defaults.delay);
        self.attempts = self.attempts.or(defaults.attempts);
        self.backoff = self.backoff.or_else(|| defaults.backoff.clone());
        self.lifo = self.lifo || defaults.lifo;
        self.timeout = self.timeout.or(defaults.timeout);
        self.remove_on_complete = self.remove_on_complete.or(defaults.remove_on_complete);
        self.remove_on_fail = self.remove_on_fail.or(defaults.remove_on_fail);
        self.stack_trace_limit = self.stack_trace_limit.or(defaults.stack_trace_limit);
        self.rate_limiter_key = self
            .rate_limiter_key
            .or_else(|| defaults.rate_limiter_key.clone());
        self.repeat = self.repeat.or_else(|| defaults.repeat.clone());
        self
    }

    pub fn validate(&self) -> JobResult<()> {
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(JobError::InvalidOptions(format!(
                    "priority must be between 0 and {}",
                    MAX_PRIORITY
                )));
            }
        }
        if let Some(job_id) = &self.job_id {
            if job_id.is_empty() {
                return Err(JobError::InvalidOptions(
                    "custom job id cannot be empty".to_string(),
                ));
            }
        }
        if let Some(repeat) = &self.repeat {
            repeat.validate()?;
        }
        Ok(())
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSpec) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_lifo(mut self) -> Self {
        self.lifo = true;
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }
}
