//! Configuration settings structures for jobline
//!
//! This module defines all configuration structures that can be loaded from
//! TOML files and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::jobs::JobOptions;
use crate::logger::{ConsoleConfig, FileConfig, LogFormat, LoggerConfig};
use crate::store::LimiterSpec;

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "jobline".to_string()
}

fn default_app_version() -> String {
    crate::pkg_version().to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_pool_size() -> u32 {
    8
}

fn default_redis_connection_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "jobline".to_string()
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_events_max_len() -> u64 {
    10_000
}

fn default_concurrency() -> usize {
    1
}

fn default_lock_duration_ms() -> u64 {
    30_000
}

fn default_drain_delay_secs() -> u64 {
    5
}

fn default_stalled_interval_ms() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_max_delay_poll_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "logs/jobline.log".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

// ============================================================================
// Application Configuration
// ============================================================================

/// Application basic information configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Application version
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Backend holding the queue structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, single process only
    Memory,
    /// Shared Redis server
    #[default]
    Redis,
}

/// Redis connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL (`redis://` or `rediss://`)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_redis_connection_timeout")]
    pub connection_timeout: u64,

    /// Prefix of every key, `{prefix}:{queue}:{type}`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            connection_timeout: default_redis_connection_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis: RedisStoreConfig,
}

// ============================================================================
// Queue Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Approximate maximum length of the event log
    #[serde(default = "default_events_max_len")]
    pub events_max_len: u64,

    /// Options merged under the options of every added job
    #[serde(default)]
    pub default_job_options: JobOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            events_max_len: default_events_max_len(),
            default_job_options: JobOptions::default(),
        }
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Admission rate limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Jobs admitted per window
    pub max: u64,

    /// Window length in milliseconds
    pub duration_ms: u64,

    /// Payload field whose value selects an independent bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

impl LimiterConfig {
    pub fn to_spec(&self) -> LimiterSpec {
        LimiterSpec {
            max: self.max,
            duration_ms: self.duration_ms,
            group_key: self.group_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lease length in milliseconds
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    /// Lease renewal period in milliseconds, half the lease when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_renew_time_ms: Option<u64>,

    /// Blocking claim timeout in seconds
    #[serde(default = "default_drain_delay_secs")]
    pub drain_delay_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<LimiterConfig>,
}

impl WorkerConfig {
    pub fn lock_renew_time_ms(&self) -> u64 {
        self.lock_renew_time_ms
            .unwrap_or(self.lock_duration_ms / 2)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_secs(self.drain_delay_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_duration_ms: default_lock_duration_ms(),
            lock_renew_time_ms: None,
            drain_delay_secs: default_drain_delay_secs(),
            limiter: None,
        }
    }
}

// ============================================================================
// Scheduler Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reaper period in milliseconds
    #[serde(default = "default_stalled_interval_ms")]
    pub stalled_interval_ms: u64,

    /// Stalls tolerated before a job fails
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Longest sleep of the delay-promotion loop in milliseconds
    #[serde(default = "default_max_delay_poll_ms")]
    pub max_delay_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stalled_interval_ms: default_stalled_interval_ms(),
            max_stalled_count: default_max_stalled_count(),
            max_delay_poll_ms: default_max_delay_poll_ms(),
        }
    }
}

// ============================================================================
// Logger Settings
// ============================================================================

/// Console output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// Whether console output is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to use colored output
    #[serde(default = "default_true")]
    pub colored: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            colored: default_true(),
        }
    }
}

/// File output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Whether file output is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Path to the log file
    #[serde(default = "default_log_path")]
    pub path: String,

    /// Whether to append to existing file
    #[serde(default = "default_true")]
    pub append: bool,

    /// Log format: "full", "compact", or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            append: default_true(),
            format: default_log_format(),
        }
    }
}

/// Logger configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level or `EnvFilter` directives
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub console: ConsoleSettings,

    #[serde(default)]
    pub file: FileSettings,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: ConsoleSettings::default(),
            file: FileSettings::default(),
        }
    }
}

impl LoggerSettings {
    /// Convert the file representation into the runtime LoggerConfig
    pub fn into_logger_config(self) -> Result<LoggerConfig, ConfigError> {
        let console_config = ConsoleConfig::new(self.console.enabled, self.console.colored);
        let file_config = self.file.into_file_config()?;

        LoggerConfig::new(console_config, file_config, self.level).map_err(|e| {
            ConfigError::ValidationError {
                field: "logger".to_string(),
                message: e.to_string(),
            }
        })
    }
}

impl FileSettings {
    pub fn into_file_config(self) -> Result<FileConfig, ConfigError> {
        let format = self.parse_format()?;

        FileConfig::new(self.enabled, PathBuf::from(self.path), self.append, format).map_err(
            |e| ConfigError::ValidationError {
                field: "logger.file".to_string(),
                message: e.to_string(),
            },
        )
    }

    pub(crate) fn parse_format(&self) -> Result<LogFormat, ConfigError> {
        self.format
            .parse::<LogFormat>()
            .map_err(|e| ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Main Settings Structure
// ============================================================================

/// Complete application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logger: LoggerSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BackoffSpec, Retention};
    use proptest::prelude::*;

    // ========================================================================
    // Arbitrary implementations for property-based testing
    // ========================================================================

    fn arb_store_config() -> impl Strategy<Value = StoreConfig> {
        (
            prop_oneof![Just(StoreBackend::Memory), Just(StoreBackend::Redis)],
            prop_oneof![
                Just("redis://127.0.0.1:6379".to_string()),
                Just("rediss://cache.internal:6380/2".to_string()),
            ],
            1u32..=64u32,
            1u64..=60u64,
            "[a-z][a-z0-9-]{0,12}",
        )
            .prop_map(
                |(backend, url, pool_size, connection_timeout, key_prefix)| StoreConfig {
                    backend,
                    redis: RedisStoreConfig {
                        url,
                        pool_size,
                        connection_timeout,
                        key_prefix,
                    },
                },
            )
    }

    fn arb_queue_config() -> impl Strategy<Value = QueueConfig> {
        (
            "[a-z][a-z0-9_-]{0,16}",
            1u64..=1_000_000u64,
            proptest::option::of(1u32..=10u32),
            proptest::option::of(1u64..=60_000u64),
            any::<bool>(),
        )
            .prop_map(|(name, events_max_len, attempts, backoff, remove)| {
                let mut default_job_options = JobOptions {
                    attempts,
                    backoff: backoff.map(BackoffSpec::exponential),
                    ..Default::default()
                };
                if remove {
                    default_job_options.remove_on_complete = Some(Retention::Remove);
                }
                QueueConfig {
                    name,
                    events_max_len,
                    default_job_options,
                }
            })
    }

    fn arb_worker_config() -> impl Strategy<Value = WorkerConfig> {
        (
            1usize..=64usize,
            1_000u64..=120_000u64,
            1u64..=30u64,
            proptest::option::of((1u64..=1_000u64, 1u64..=60_000u64)),
        )
            .prop_map(|(concurrency, lock_duration_ms, drain_delay_secs, limiter)| {
                WorkerConfig {
                    concurrency,
                    lock_duration_ms,
                    lock_renew_time_ms: Some(lock_duration_ms / 3),
                    drain_delay_secs,
                    limiter: limiter.map(|(max, duration_ms)| LimiterConfig {
                        max,
                        duration_ms,
                        group_key: None,
                    }),
                }
            })
    }

    fn arb_scheduler_config() -> impl Strategy<Value = SchedulerConfig> {
        (1u64..=600_000u64, 0u32..=10u32, 1u64..=60_000u64).prop_map(
            |(stalled_interval_ms, max_stalled_count, max_delay_poll_ms)| SchedulerConfig {
                stalled_interval_ms,
                max_stalled_count,
                max_delay_poll_ms,
            },
        )
    }

    fn arb_logger_settings() -> impl Strategy<Value = LoggerSettings> {
        (
            prop_oneof![
                Just("trace".to_string()),
                Just("debug".to_string()),
                Just("info".to_string()),
                Just("warn".to_string()),
                Just("error".to_string()),
            ],
            any::<bool>(),
            any::<bool>(),
            prop_oneof![
                Just("json".to_string()),
                Just("full".to_string()),
                Just("compact".to_string()),
            ],
        )
            .prop_map(|(level, colored, file_enabled, format)| LoggerSettings {
                level,
                console: ConsoleSettings {
                    enabled: true,
                    colored,
                },
                file: FileSettings {
                    enabled: file_enabled,
                    format,
                    ..Default::default()
                },
            })
    }

    fn arb_settings() -> impl Strategy<Value = Settings> {
        (
            arb_store_config(),
            arb_queue_config(),
            arb_worker_config(),
            arb_scheduler_config(),
            arb_logger_settings(),
        )
            .prop_map(|(store, queue, worker, scheduler, logger)| Settings {
                application: ApplicationConfig::default(),
                store,
                queue,
                worker,
                scheduler,
                logger,
            })
    }

    // ========================================================================
    // Property-based tests
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Serializing any settings to TOML and back yields the same settings.
        #[test]
        fn prop_settings_round_trip_serialization(settings in arb_settings()) {
            let toml_str = toml::to_string(&settings)
                .expect("Settings should serialize to TOML");

            let deserialized: Settings = toml::from_str(&toml_str)
                .expect("TOML should deserialize back to Settings");

            prop_assert_eq!(settings, deserialized);
        }
    }

    // ========================================================================
    // Unit tests
    // ========================================================================

    #[test]
    fn test_application_config_defaults() {
        let config = ApplicationConfig::default();
        assert_eq!(config.name, "jobline");
        assert_eq!(config.version, crate::pkg_version());
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, StoreBackend::Redis);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.redis.pool_size, 8);
        assert_eq!(config.redis.connection_timeout, 5);
        assert_eq!(config.redis.key_prefix, "jobline");
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.lock_duration_ms, 30_000);
        assert_eq!(config.lock_renew_time_ms(), 15_000);
        assert_eq!(config.drain_delay(), Duration::from_secs(5));
        assert!(config.limiter.is_none());
    }

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.stalled_interval_ms, 30_000);
        assert_eq!(config.max_stalled_count, 1);
        assert_eq!(config.max_delay_poll_ms, 5_000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[store]
backend = "memory"

[worker]
concurrency = 4

[worker.limiter]
max = 10
duration_ms = 1000
group_key = "account"
"#,
        )
        .unwrap();
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.worker.concurrency, 4);
        assert_eq!(settings.worker.lock_duration_ms, 30_000);
        let limiter = settings.worker.limiter.unwrap().to_spec();
        assert_eq!(limiter.group_key.as_deref(), Some("account"));
        assert_eq!(settings.queue.name, "default");
    }

    #[test]
    fn test_queue_default_job_options_from_toml() {
        let settings: Settings = toml::from_str(
            r#"
[queue.default_job_options]
attempts = 3
backoff = { type = "exponential", delay = 1000 }
removeOnComplete = 100
"#,
        )
        .unwrap();
        let options = &settings.queue.default_job_options;
        assert_eq!(options.attempts, Some(3));
        assert_eq!(options.backoff, Some(BackoffSpec::exponential(1000)));
        assert_eq!(options.remove_on_complete, Some(Retention::KeepLast(100)));
    }

    #[test]
    fn test_logger_settings_conversion() {
        let settings = LoggerSettings {
            file: FileSettings {
                enabled: true,
                format: "compact".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = settings.into_logger_config().unwrap();
        assert_eq!(config.file.format, LogFormat::Compact);
        assert!(config.file.enabled);
    }
}
