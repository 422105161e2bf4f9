//! Repeatable jobs: next occurrence computation and successor enqueueing.
//!
//! A repeatable descriptor is identified by its repeat key
//! `{name}:{customId}:{endDate}:{tz}:{cron|every}`. The store keeps one
//! sorted entry per key scored by the next fire time; each occurrence is an
//! ordinary delayed job with the deterministic id `repeat:{hash}:{millis}`,
//! so schedulers racing on the same occurrence enqueue it once.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::jobs::{Job, JobError, JobOptions, JobResult, RepeatOptions};
use crate::store::AtomicStore;
use crate::utils::now_ms;

/// Builds the key identifying a repeatable descriptor.
pub fn repeat_key(name: &str, repeat: &RepeatOptions) -> String {
    let end_date = repeat.end_date.map(|d| d.to_string()).unwrap_or_default();
    let suffix = match (&repeat.cron, repeat.every) {
        (Some(cron), _) => cron.clone(),
        (None, Some(every)) => every.to_string(),
        (None, None) => String::new(),
    };
    format!(
        "{}:{}:{}:{}:{}",
        name,
        repeat.job_id.as_deref().unwrap_or_default(),
        end_date,
        repeat.tz.as_deref().unwrap_or_default(),
        suffix
    )
}

/// Stable hash of a repeat key (UUID v5 in the OID namespace).
pub fn repeat_hash(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
        .simple()
        .to_string()
}

pub fn repeat_job_id(key: &str, millis: i64) -> String {
    format!("repeat:{}:{}", repeat_hash(key), millis)
}

fn parse_timezone(tz: Option<&str>) -> JobResult<Tz> {
    match tz {
        None => Ok(Tz::UTC),
        Some(name) => Tz::from_str(name)
            .map_err(|_| JobError::InvalidRepeat(format!("Unknown timezone '{}'", name))),
    }
}

fn parse_cron(pattern: &str) -> JobResult<Cron> {
    Cron::new(pattern)
        .with_seconds_optional()
        .parse()
        .map_err(|e| JobError::InvalidCronExpression(format!("{}: {}", pattern, e)))
}

/// Checks the pattern and timezone without computing anything.
pub fn validate_repeat(repeat: &RepeatOptions) -> JobResult<()> {
    repeat.validate()?;
    if let Some(pattern) = &repeat.cron {
        parse_cron(pattern)?;
    }
    parse_timezone(repeat.tz.as_deref())?;
    Ok(())
}

/// First fire time strictly after `after`, or `None` when the schedule has
/// ended.
///
/// Interval schedules are aligned to multiples of `every`. A start date in
/// the future moves the reference point forward to it.
pub fn next_millis(repeat: &RepeatOptions, after: i64) -> JobResult<Option<i64>> {
    let reference = match repeat.start_date {
        Some(start) if start > after => start - 1,
        _ => after,
    };

    let next = match (&repeat.cron, repeat.every) {
        (Some(pattern), _) => {
            let cron = parse_cron(pattern)?;
            let tz = parse_timezone(repeat.tz.as_deref())?;
            let Some(utc) = Utc.timestamp_millis_opt(reference).single() else {
                return Ok(None);
            };
            let local: DateTime<Tz> = utc.with_timezone(&tz);
            match cron.find_next_occurrence(&local, false) {
                Ok(at) => at.timestamp_millis(),
                Err(_) => return Ok(None),
            }
        }
        (None, Some(every)) if every > 0 => {
            let every = every as i64;
            reference.div_euclid(every) * every + every
        }
        _ => {
            return Err(JobError::InvalidRepeat(
                "either cron or every must be set".to_string(),
            ));
        }
    };

    match repeat.end_date {
        Some(end) if next > end => Ok(None),
        _ => Ok(Some(next)),
    }
}

/// One registered repeatable descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatableJob {
    pub key: String,
    pub name: String,
    pub id: Option<String>,
    pub end_date: Option<i64>,
    pub tz: Option<String>,
    /// Cron pattern or interval in milliseconds
    pub pattern: String,
    /// Next scheduled fire time
    pub next: i64,
}

impl RepeatableJob {
    /// Splits a repeat key back into its parts. The name may itself contain `:`.
    pub fn from_key(key: &str, next: i64) -> Self {
        let mut parts = key.rsplitn(5, ':');
        let pattern = parts.next().unwrap_or_default().to_string();
        let tz = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let end_date = parts.next().and_then(|s| s.parse().ok());
        let id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let name = parts.next().unwrap_or_default().to_string();
        Self {
            key: key.to_string(),
            name,
            id,
            end_date,
            tz,
            pattern,
            next,
        }
    }
}

/// Enqueues occurrences of repeatable jobs.
#[derive(Clone)]
pub struct Repeat {
    store: Arc<dyn AtomicStore>,
}

impl Repeat {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Schedules the occurrence following the one described by `opts`.
    ///
    /// The reference time is the previous scheduled fire time, or now when
    /// that lies in the past, so missed occurrences are skipped rather than
    /// replayed. With `require_registered` set, nothing is scheduled once
    /// the descriptor has been removed.
    pub async fn schedule_next(
        &self,
        name: &str,
        data: JsonValue,
        opts: &JobOptions,
        require_registered: bool,
    ) -> QueueResult<Option<Job>> {
        let Some(repeat) = opts.repeat.clone() else {
            return Ok(None);
        };

        let count = repeat.count.unwrap_or(0) + 1;
        if repeat.limit.is_some_and(|limit| count > limit) {
            debug!(job_name = %name, count, "Repeat limit reached");
            return Ok(None);
        }

        let now = now_ms();
        if repeat.end_date.is_some_and(|end| end < now) {
            return Ok(None);
        }

        let reference = repeat.prev_millis.unwrap_or(0).max(now);
        let Some(next) = next_millis(&repeat, reference)? else {
            return Ok(None);
        };

        let key = repeat_key(name, &repeat);
        if require_registered && self.store.repeatable_next(&key).await?.is_none() {
            debug!(repeat_key = %key, "Repeatable removed, not scheduling");
            return Ok(None);
        }
        self.store.upsert_repeatable(&key, next).await?;

        let mut next_repeat = repeat;
        next_repeat.count = Some(count);
        next_repeat.prev_millis = Some(next);

        let job_opts = JobOptions {
            job_id: Some(repeat_job_id(&key, next)),
            timestamp: Some(now),
            delay: Some((next - now).max(0) as u64),
            repeat: Some(next_repeat),
            ..opts.clone()
        };

        let mut job = Job::new(name, data, job_opts);
        job.id = self.store.enqueue(&job).await?;
        debug!(job_id = %job.id, repeat_key = %key, next, "Repeat occurrence scheduled");
        Ok(Some(job))
    }

    /// Removes a descriptor and its pending occurrence.
    pub async fn remove(&self, name: &str, repeat: &RepeatOptions) -> QueueResult<bool> {
        self.remove_by_key(&repeat_key(name, repeat)).await
    }

    pub async fn remove_by_key(&self, key: &str) -> QueueResult<bool> {
        let next = self.store.repeatable_next(key).await?;
        let removed = self.store.remove_repeatable(key).await?;
        if let Some(next) = next {
            match self.store.remove(&repeat_job_id(key, next)).await {
                Ok(_) => {}
                // An occurrence already running finishes normally.
                Err(crate::store::StoreError::JobIsActive { .. }) => {}
                Err(e) => return Err(QueueError::from(e)),
            }
        }
        Ok(removed)
    }

    pub async fn list(&self) -> QueueResult<Vec<RepeatableJob>> {
        let entries = self.store.repeatables().await?;
        Ok(entries
            .into_iter()
            .map(|(key, next)| RepeatableJob::from_key(&key, next))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_repeat_key_layout() {
        let mut repeat = RepeatOptions::cron("0 * * * *");
        repeat.tz = Some("Europe/Berlin".to_string());
        assert_eq!(repeat_key("report", &repeat), "report:::Europe/Berlin:0 * * * *");

        let mut every = RepeatOptions::every(5000);
        every.job_id = Some("nightly".to_string());
        every.end_date = Some(10);
        assert_eq!(repeat_key("sync", &every), "sync:nightly:10::5000");
    }

    #[test]
    fn test_repeat_job_id_is_deterministic() {
        let a = repeat_job_id("report:::UTC:0 * * * *", 1000);
        let b = repeat_job_id("report:::UTC:0 * * * *", 1000);
        assert_eq!(a, b);
        assert!(a.starts_with("repeat:"));
        assert!(a.ends_with(":1000"));
        assert_ne!(a, repeat_job_id("other:::UTC:0 * * * *", 1000));
    }

    #[test]
    fn test_repeatable_job_from_key() {
        let parsed = RepeatableJob::from_key("a:b:c:10::5000", 42);
        assert_eq!(parsed.name, "a:b");
        assert_eq!(parsed.id.as_deref(), Some("c"));
        assert_eq!(parsed.end_date, Some(10));
        assert_eq!(parsed.tz, None);
        assert_eq!(parsed.pattern, "5000");
        assert_eq!(parsed.next, 42);
    }

    #[test]
    fn test_next_millis_every_is_aligned() {
        let repeat = RepeatOptions::every(1000);
        assert_eq!(next_millis(&repeat, 1500).unwrap(), Some(2000));
        assert_eq!(next_millis(&repeat, 2000).unwrap(), Some(3000));
    }

    #[test]
    fn test_next_millis_cron_with_seconds_and_timezone() {
        // 2024-01-01T00:00:00Z
        let base = 1_704_067_200_000;
        let every_ten_seconds = RepeatOptions::cron("*/10 * * * * *");
        assert_eq!(next_millis(&every_ten_seconds, base).unwrap(), Some(base + 10_000));

        let mut nine_am = RepeatOptions::cron("0 9 * * *");
        nine_am.tz = Some("Asia/Tokyo".to_string());
        // 09:00 in Tokyo is 00:00 UTC, so the next one is a day later.
        assert_eq!(
            next_millis(&nine_am, base).unwrap(),
            Some(base + 24 * 3600 * 1000)
        );
    }

    #[test]
    fn test_next_millis_honours_start_and_end() {
        let mut repeat = RepeatOptions::every(1000);
        repeat.start_date = Some(10_000);
        assert_eq!(next_millis(&repeat, 0).unwrap(), Some(10_000));

        repeat.end_date = Some(10_500);
        assert_eq!(next_millis(&repeat, 10_000).unwrap(), None);
    }

    #[test]
    fn test_validate_repeat_rejects_bad_input() {
        assert!(validate_repeat(&RepeatOptions::cron("not a cron")).is_err());
        let mut tz = RepeatOptions::cron("* * * * *");
        tz.tz = Some("Mars/Olympus".to_string());
        assert!(validate_repeat(&tz).is_err());
        assert!(validate_repeat(&RepeatOptions::every(10)).is_ok());
    }

    proptest! {
        #[test]
        fn property_every_next_is_after_reference(
            after in 0i64..4_000_000_000_000,
            every in 1u64..86_400_000,
        ) {
            let next = next_millis(&RepeatOptions::every(every), after).unwrap().unwrap();
            prop_assert!(next > after);
            prop_assert!(next - after <= every as i64);
            prop_assert_eq!(next % every as i64, 0);
        }
    }

    #[tokio::test]
    async fn test_schedule_next_converges_and_respects_limit() {
        let store = Arc::new(MemoryStore::new("repeat", 100));
        let repeat = Repeat::new(store.clone());

        let mut spec = RepeatOptions::every(60_000);
        spec.limit = Some(2);
        let opts = JobOptions::default().with_repeat(spec);

        let first = repeat
            .schedule_next("tick", json!({}), &opts, false)
            .await
            .unwrap()
            .unwrap();
        // A second scheduler computing the same occurrence converges on it.
        let again = repeat
            .schedule_next("tick", json!({}), &opts, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.count(JobState::Delayed).await.unwrap(), 1);

        let second = repeat
            .schedule_next("tick", json!({}), &first.opts, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.opts.repeat.as_ref().unwrap().count, Some(2));
        assert!(second.opts.repeat.as_ref().unwrap().prev_millis > first.opts.repeat.as_ref().unwrap().prev_millis);

        assert!(
            repeat
                .schedule_next("tick", json!({}), &second.opts, true)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_removed_descriptor_stops_the_chain() {
        let store = Arc::new(MemoryStore::new("repeat", 100));
        let repeat = Repeat::new(store.clone());
        let opts = JobOptions::default().with_repeat(RepeatOptions::every(60_000));

        let first = repeat
            .schedule_next("tick", json!({}), &opts, false)
            .await
            .unwrap()
            .unwrap();
        let listed = repeat.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "tick");
        assert_eq!(listed[0].pattern, "60000");

        assert!(repeat.remove("tick", &RepeatOptions::every(60_000)).await.unwrap());
        assert!(store.get_job(&first.id).await.unwrap().is_none());
        assert!(
            repeat
                .schedule_next("tick", json!({}), &first.opts, true)
                .await
                .unwrap()
                .is_none()
        );
    }
}
