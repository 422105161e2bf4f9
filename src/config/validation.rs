//! Configuration validation logic
//!
//! This module provides validation methods for all configuration structures
//! to ensure configuration values are within acceptable ranges and formats.

use crate::config::error::ConfigError;
use crate::config::settings::{
    FileSettings, LimiterConfig, LoggerSettings, QueueConfig, RedisStoreConfig, SchedulerConfig,
    Settings, StoreBackend, StoreConfig, WorkerConfig,
};

/// Valid log levels
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log formats
const VALID_LOG_FORMATS: &[&str] = &["full", "compact", "json"];

impl RedisStoreConfig {
    /// Validate Redis connection settings
    ///
    /// # Validation Rules
    /// - URL must use the `redis://`, `rediss://` or `unix://` scheme
    /// - Pool size must be greater than 0
    /// - Key prefix must not be empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_schemes = ["redis://", "rediss://", "unix://", "redis+unix://"];
        if self.url.trim().is_empty() {
            return Err(ConfigError::validation(
                "store.redis.url",
                "Redis URL is required when the redis backend is selected.",
            ));
        }
        if !valid_schemes.iter().any(|scheme| self.url.starts_with(scheme)) {
            return Err(ConfigError::validation(
                "store.redis.url",
                "Invalid Redis URL format. Expected format: redis://[user:password@]host[:port][/db]",
            ));
        }

        if self.pool_size == 0 {
            return Err(ConfigError::validation(
                "store.redis.pool_size",
                "Pool size must be greater than 0.",
            ));
        }

        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::validation(
                "store.redis.key_prefix",
                "Key prefix must not be empty.",
            ));
        }

        Ok(())
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            StoreBackend::Redis => self.redis.validate(),
            StoreBackend::Memory => Ok(()),
        }
    }
}

impl QueueConfig {
    /// Validate queue configuration
    ///
    /// # Validation Rules
    /// - Name must not be empty and must not contain `:`
    /// - Event log length must be greater than 0
    /// - Default job options must be valid job options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::validation(
                "queue.name",
                "Queue name must not be empty.",
            ));
        }
        if self.name.contains(':') {
            return Err(ConfigError::validation(
                "queue.name",
                "Queue name must not contain ':'.",
            ));
        }

        if self.events_max_len == 0 {
            return Err(ConfigError::validation(
                "queue.events_max_len",
                "Event log length must be greater than 0.",
            ));
        }

        self.default_job_options
            .validate()
            .map_err(|e| ConfigError::validation("queue.default_job_options", e.to_string()))
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::validation(
                "worker.limiter.max",
                "Limiter max must be greater than 0.",
            ));
        }
        if self.duration_ms == 0 {
            return Err(ConfigError::validation(
                "worker.limiter.duration_ms",
                "Limiter duration must be greater than 0 milliseconds.",
            ));
        }
        Ok(())
    }
}

impl WorkerConfig {
    /// Validate worker configuration
    ///
    /// # Validation Rules
    /// - Concurrency must be greater than 0
    /// - Lease duration must be greater than 0
    /// - Lease renewal must be greater than 0 and shorter than the lease
    /// - Drain delay must be greater than 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::validation(
                "worker.concurrency",
                "Concurrency must be greater than 0.",
            ));
        }

        if self.lock_duration_ms == 0 {
            return Err(ConfigError::validation(
                "worker.lock_duration_ms",
                "Lock duration must be greater than 0 milliseconds.",
            ));
        }

        let renew = self.lock_renew_time_ms();
        if renew == 0 || renew >= self.lock_duration_ms {
            return Err(ConfigError::validation(
                "worker.lock_renew_time_ms",
                format!(
                    "Lock renew time ({} ms) must be greater than 0 and below the lock duration ({} ms).",
                    renew, self.lock_duration_ms
                ),
            ));
        }

        if self.drain_delay_secs == 0 {
            return Err(ConfigError::validation(
                "worker.drain_delay_secs",
                "Drain delay must be greater than 0 seconds.",
            ));
        }

        if let Some(limiter) = &self.limiter {
            limiter.validate()?;
        }

        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration
    ///
    /// # Validation Rules
    /// - Stalled interval must be greater than 0
    /// - Delay poll cap must be greater than 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stalled_interval_ms == 0 {
            return Err(ConfigError::validation(
                "scheduler.stalled_interval_ms",
                "Stalled interval must be greater than 0 milliseconds.",
            ));
        }

        if self.max_delay_poll_ms == 0 {
            return Err(ConfigError::validation(
                "scheduler.max_delay_poll_ms",
                "Delay poll cap must be greater than 0 milliseconds.",
            ));
        }

        Ok(())
    }
}

impl FileSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.trim().is_empty() {
            return Err(ConfigError::validation(
                "logger.file.path",
                "File path is required when file logging is enabled.",
            ));
        }

        if !VALID_LOG_FORMATS.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::validation(
                "logger.file.format",
                format!(
                    "Invalid log format '{}'. Valid formats are: {}",
                    self.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

impl LoggerSettings {
    /// Validate logger settings
    ///
    /// # Validation Rules
    /// - Base level must be one of trace, debug, info, warn, error
    /// - At least one output must be enabled
    /// - File settings must be valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.level.split(',').next().unwrap_or_default().trim();
        if !VALID_LOG_LEVELS.contains(&base.to_lowercase().as_str()) {
            return Err(ConfigError::validation(
                "logger.level",
                format!(
                    "Invalid log level '{}'. Valid levels are: {}",
                    self.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        if !self.console.enabled && !self.file.enabled {
            return Err(ConfigError::validation(
                "logger",
                "At least one output (console or file) must be enabled.",
            ));
        }

        self.file.validate()
    }
}

impl Settings {
    /// Validate every section, stopping at the first error
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.queue.validate()?;
        self.worker.validate()?;
        self.scheduler.validate()?;
        self.logger.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    // ========================================================================
    // Store validation tests
    // ========================================================================

    #[test]
    fn test_store_defaults_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_redis_invalid_url() {
        let config = RedisStoreConfig {
            url: "postgres://localhost".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(config.validate().unwrap_err()), "store.redis.url");
    }

    #[test]
    fn test_redis_empty_prefix() {
        let config = RedisStoreConfig {
            key_prefix: " ".to_string(),
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "store.redis.key_prefix"
        );
    }

    #[test]
    fn test_memory_backend_skips_redis_checks() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            redis: RedisStoreConfig {
                url: String::new(),
                ..Default::default()
            },
        };
        assert!(config.validate().is_ok());
    }

    // ========================================================================
    // Queue and worker validation tests
    // ========================================================================

    #[test]
    fn test_queue_name_rules() {
        let empty = QueueConfig {
            name: String::new(),
            ..Default::default()
        };
        assert_eq!(field_of(empty.validate().unwrap_err()), "queue.name");

        let colon = QueueConfig {
            name: "mail:out".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(colon.validate().unwrap_err()), "queue.name");
    }

    #[test]
    fn test_worker_zero_concurrency() {
        let config = WorkerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "worker.concurrency"
        );
    }

    #[test]
    fn test_worker_renew_must_be_below_lease() {
        let config = WorkerConfig {
            lock_duration_ms: 1_000,
            lock_renew_time_ms: Some(1_000),
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "worker.lock_renew_time_ms"
        );
    }

    #[test]
    fn test_worker_limiter_rules() {
        let config = WorkerConfig {
            limiter: Some(LimiterConfig {
                max: 0,
                duration_ms: 1000,
                group_key: None,
            }),
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "worker.limiter.max"
        );
    }

    #[test]
    fn test_scheduler_zero_stalled_interval() {
        let config = SchedulerConfig {
            stalled_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "scheduler.stalled_interval_ms"
        );
    }

    // ========================================================================
    // Logger validation tests
    // ========================================================================

    #[test]
    fn test_logger_invalid_level() {
        let settings = LoggerSettings {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(settings.validate().unwrap_err()), "logger.level");
    }

    #[test]
    fn test_logger_directive_level_accepted() {
        let settings = LoggerSettings {
            level: "debug,jobline::store=trace".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_logger_file_enabled_empty_path() {
        let settings = LoggerSettings {
            file: FileSettings {
                enabled: true,
                path: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "logger.file.path"
        );
    }

    #[test]
    fn test_logger_invalid_format() {
        let settings = LoggerSettings {
            file: FileSettings {
                format: "xml".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "logger.file.format"
        );
    }

    // ========================================================================
    // Settings validation tests
    // ========================================================================

    #[test]
    fn test_settings_default_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_settings_reports_first_invalid_section() {
        let settings = Settings {
            worker: WorkerConfig {
                concurrency: 0,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                stalled_interval_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "worker.concurrency"
        );
    }
}
