use thiserror::Error;

use crate::config::error::ConfigError;
use crate::error::StoreErrorConverter;
use crate::jobs::JobError;
use crate::store::StoreError;

/// Engine-wide error type.
///
/// Variants follow the failure categories the engine distinguishes: transient
/// store trouble, protocol violations on a job record (missing key or lease),
/// processor failures, caller validation errors and configuration errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The store could not be reached; never recorded as a job outcome
    #[error("Store unavailable during {operation}")]
    TransientStore {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// The job record disappeared while an operation was running
    #[error("Missing key for job {job_id} during {command}")]
    MissingJobKey { job_id: String, command: String },

    /// The caller no longer owns the job's lease
    #[error("Missing lease for job {job_id} during {command}")]
    MissingLease { job_id: String, command: String },

    /// A processor failed outside of a job outcome (e.g. sandbox spawn)
    #[error("Processor error: {message}")]
    Processor { message: String },

    /// Caller input rejected, no state mutated
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Resource not found error with entity, field, and value information
    #[error("Resource not found: {entity} with {field}={value}")]
    NotFound {
        entity: String,
        field: String,
        value: String,
    },

    /// Configuration error with key information
    #[error("Configuration error: {key}")]
    Configuration {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Store replied with something the engine could not use
    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Internal error for unexpected failures
    #[error("Internal error")]
    Internal {
        #[source]
        source: anyhow::Error,
    },
}

impl QueueError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        QueueError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        QueueError::Configuration {
            key: key.into(),
            source: anyhow::Error::msg(message.into()),
        }
    }

    /// Missing key or missing lease.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            QueueError::MissingJobKey { .. } | QueueError::MissingLease { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::TransientStore { .. })
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(error: anyhow::Error) -> Self {
        QueueError::Internal { source: error }
    }
}

impl From<StoreError> for QueueError {
    fn from(error: StoreError) -> Self {
        StoreErrorConverter::convert(error, "store operation")
    }
}

impl From<JobError> for QueueError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::InvalidRepeat(reason) => QueueError::validation("repeat", reason),
            JobError::InvalidCronExpression(reason) => QueueError::validation("repeat.cron", reason),
            JobError::InvalidOptions(reason) => QueueError::validation("opts", reason),
            other => QueueError::Internal {
                source: anyhow::Error::from(other),
            },
        }
    }
}

impl From<ConfigError> for QueueError {
    fn from(error: ConfigError) -> Self {
        let key = match &error {
            ConfigError::ValidationError { field, .. } => field.clone(),
            _ => "settings".to_string(),
        };
        QueueError::Configuration {
            key,
            source: anyhow::Error::from(error),
        }
    }
}

/// Type alias for Result with QueueError to simplify function signatures
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        let missing = QueueError::MissingLease {
            job_id: "1".to_string(),
            command: "finalize".to_string(),
        };
        assert!(missing.is_protocol());
        assert!(!missing.is_transient());
        assert!(!QueueError::validation("id", "bad").is_protocol());
    }

    #[test]
    fn test_job_error_conversion() {
        let err: QueueError = JobError::InvalidRepeat("nope".to_string()).into();
        assert!(matches!(err, QueueError::Validation { ref field, .. } if field == "repeat"));
    }

    #[test]
    fn test_config_error_conversion_keeps_field() {
        let err: QueueError = ConfigError::validation("worker.concurrency", "must be > 0").into();
        assert!(
            matches!(err, QueueError::Configuration { ref key, .. } if key == "worker.concurrency")
        );
    }
}
