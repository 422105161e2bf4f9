//! Retry backoff strategies.
//!
//! A backoff spec is stored in the job options either as a bare number (a fixed
//! delay in milliseconds) or as `{"type": "...", "delay": ...}`. The built-in
//! types are `fixed` and `exponential`; any other type name resolves to a custom
//! strategy registered on the worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;
use crate::jobs::error::{JobError, JobResult};

/// Delay value meaning "do not retry, fail now".
pub const NO_RETRY: i64 = -1;

/// Backoff configuration carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BackoffRepr", into = "BackoffRepr")]
pub enum BackoffSpec {
    Fixed { delay: u64 },
    Exponential { delay: u64 },
    Custom { name: String, delay: Option<u64> },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BackoffRepr {
    Delay(u64),
    Typed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
    },
}

impl From<BackoffRepr> for BackoffSpec {
    fn from(repr: BackoffRepr) -> Self {
        match repr {
            BackoffRepr::Delay(delay) => BackoffSpec::Fixed { delay },
            BackoffRepr::Typed { kind, delay } => match kind.as_str() {
                "fixed" => BackoffSpec::Fixed {
                    delay: delay.unwrap_or(0),
                },
                "exponential" => BackoffSpec::Exponential {
                    delay: delay.unwrap_or(0),
                },
                _ => BackoffSpec::Custom { name: kind, delay },
            },
        }
    }
}

impl From<BackoffSpec> for BackoffRepr {
    fn from(spec: BackoffSpec) -> Self {
        match spec {
            BackoffSpec::Fixed { delay } => BackoffRepr::Typed {
                kind: "fixed".to_string(),
                delay: Some(delay),
            },
            BackoffSpec::Exponential { delay } => BackoffRepr::Typed {
                kind: "exponential".to_string(),
                delay: Some(delay),
            },
            BackoffSpec::Custom { name, delay } => BackoffRepr::Typed { kind: name, delay },
        }
    }
}

impl BackoffSpec {
    pub fn fixed(delay: u64) -> Self {
        BackoffSpec::Fixed { delay }
    }

    pub fn exponential(delay: u64) -> Self {
        BackoffSpec::Exponential { delay }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        BackoffSpec::Custom {
            name: name.into(),
            delay: None,
        }
    }
}

/// User supplied backoff. May be asynchronous; return [`NO_RETRY`] to fail
/// the job regardless of remaining attempts.
#[async_trait]
pub trait BackoffStrategy: Send + Sync {
    async fn delay(&self, attempts_made: u32, error: &ProcessorError) -> i64;
}

#[async_trait]
impl<F> BackoffStrategy for F
where
    F: Fn(u32, &ProcessorError) -> i64 + Send + Sync,
{
    async fn delay(&self, attempts_made: u32, error: &ProcessorError) -> i64 {
        (self)(attempts_made, error)
    }
}

/// Named custom strategies, looked up by the backoff `type`.
pub type BackoffStrategies = HashMap<String, Arc<dyn BackoffStrategy>>;

/// `base * (2^attempts_made - 1)`, saturating.
pub fn exponential_delay(base: u64, attempts_made: u32) -> i64 {
    let factor = 2u64
        .checked_pow(attempts_made)
        .map(|p| p - 1)
        .unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor);
    i64::try_from(delay).unwrap_or(i64::MAX)
}

/// Computes the retry delay in milliseconds for the attempt that just failed.
///
/// `attempts_made` already includes the failed attempt. A job without a
/// backoff spec is retried immediately (delay 0).
pub async fn compute_delay(
    spec: Option<&BackoffSpec>,
    attempts_made: u32,
    error: &ProcessorError,
    strategies: &BackoffStrategies,
) -> JobResult<i64> {
    match spec {
        None => Ok(0),
        Some(BackoffSpec::Fixed { delay }) => Ok(i64::try_from(*delay).unwrap_or(i64::MAX)),
        Some(BackoffSpec::Exponential { delay }) => Ok(exponential_delay(*delay, attempts_made)),
        Some(BackoffSpec::Custom { name, .. }) => {
            let strategy = strategies.get(name).ok_or_else(|| {
                JobError::InvalidOptions(format!("Unknown backoff strategy '{}'", name))
            })?;
            Ok(strategy.delay(attempts_made, error).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn error() -> ProcessorError {
        ProcessorError::new("boom")
    }

    #[test]
    fn test_backoff_spec_from_number_is_fixed() {
        let spec: BackoffSpec = serde_json::from_str("1500").unwrap();
        assert_eq!(spec, BackoffSpec::fixed(1500));
    }

    #[test]
    fn test_backoff_spec_typed_forms() {
        let spec: BackoffSpec =
            serde_json::from_str(r#"{"type":"exponential","delay":1000}"#).unwrap();
        assert_eq!(spec, BackoffSpec::exponential(1000));

        let spec: BackoffSpec = serde_json::from_str(r#"{"type":"jitter"}"#).unwrap();
        assert_eq!(spec, BackoffSpec::custom("jitter"));

        let json = serde_json::to_value(BackoffSpec::fixed(10)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "fixed", "delay": 10}));
    }

    #[test]
    fn test_exponential_delay_values() {
        assert_eq!(exponential_delay(1000, 1), 1000);
        assert_eq!(exponential_delay(1000, 2), 3000);
        assert_eq!(exponential_delay(1000, 3), 7000);
        assert_eq!(exponential_delay(1000, 200), i64::MAX);
    }

    #[tokio::test]
    async fn test_compute_delay_without_spec_retries_immediately() {
        let delay = compute_delay(None, 1, &error(), &BackoffStrategies::new())
            .await
            .unwrap();
        assert_eq!(delay, 0);
    }

    #[tokio::test]
    async fn test_compute_delay_custom_strategy() {
        let mut strategies = BackoffStrategies::new();
        strategies.insert(
            "linear".to_string(),
            Arc::new(|attempts: u32, _: &ProcessorError| attempts as i64 * 100),
        );
        strategies.insert(
            "never".to_string(),
            Arc::new(|_: u32, _: &ProcessorError| NO_RETRY),
        );

        let linear = BackoffSpec::custom("linear");
        assert_eq!(
            compute_delay(Some(&linear), 3, &error(), &strategies)
                .await
                .unwrap(),
            300
        );

        let never = BackoffSpec::custom("never");
        assert_eq!(
            compute_delay(Some(&never), 1, &error(), &strategies)
                .await
                .unwrap(),
            NO_RETRY
        );
    }

    #[tokio::test]
    async fn test_compute_delay_unknown_custom_strategy() {
        let spec = BackoffSpec::custom("missing");
        let result = compute_delay(Some(&spec), 1, &error(), &BackoffStrategies::new()).await;
        assert!(matches!(result, Err(JobError::InvalidOptions(_))));
    }

    proptest! {
        #[test]
        fn property_exponential_delay_doubles_plus_base(base in 1u64..10_000, attempts in 1u32..20) {
            let current = exponential_delay(base, attempts);
            let next = exponential_delay(base, attempts + 1);
            prop_assert_eq!(next, current * 2 + base as i64);
        }
    }
}
