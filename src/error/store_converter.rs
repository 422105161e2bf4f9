use crate::error::QueueError;
use crate::store::StoreError;

/// Maps adapter-level store errors onto the engine's error categories.
pub struct StoreErrorConverter;

impl StoreErrorConverter {
    /// Converts a store error raised while running `operation`.
    ///
    /// # Arguments
    /// * `error` - The adapter error
    /// * `operation` - Name of the store operation that failed
    ///
    /// # Returns
    /// A transient error for connectivity problems, a protocol error for
    /// missing keys or leases, a validation error for rejected retries and a
    /// generic store error otherwise.
    pub fn convert(error: StoreError, operation: &str) -> QueueError {
        match error {
            StoreError::Connection(message) => QueueError::TransientStore {
                operation: operation.to_string(),
                source: anyhow::Error::msg(message),
            },
            StoreError::MissingJobKey { job_id, command } => {
                QueueError::MissingJobKey { job_id, command }
            }
            StoreError::MissingLease { job_id, command } => {
                QueueError::MissingLease { job_id, command }
            }
            StoreError::JobNotFound { job_id } => QueueError::NotFound {
                entity: "job".to_string(),
                field: "id".to_string(),
                value: job_id,
            },
            StoreError::JobIsActive { job_id } => QueueError::Validation {
                field: "job_id".to_string(),
                reason: format!("Job {} is active", job_id),
            },
            StoreError::JobNotInState { job_id, state } => QueueError::Validation {
                field: "state".to_string(),
                reason: format!("Job {} is not in the {} state", job_id, state),
            },
            other @ (StoreError::Operation(_) | StoreError::Serialization(_)) => QueueError::Store {
                operation: operation.to_string(),
                source: anyhow::Error::from(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;

    #[test]
    fn test_connection_errors_are_transient() {
        let err = StoreErrorConverter::convert(StoreError::Connection("refused".into()), "enqueue");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Store unavailable during enqueue");
    }

    #[test]
    fn test_retry_codes_become_validation_errors() {
        let active = StoreErrorConverter::convert(
            StoreError::JobIsActive { job_id: "3".into() },
            "retry",
        );
        assert!(matches!(active, QueueError::Validation { .. }));

        let wrong_state = StoreErrorConverter::convert(
            StoreError::JobNotInState {
                job_id: "3".into(),
                state: JobState::Failed,
            },
            "retry",
        );
        assert!(wrong_state.to_string().contains("state"));

        let missing = StoreErrorConverter::convert(
            StoreError::JobNotFound { job_id: "9".into() },
            "retry",
        );
        assert!(matches!(missing, QueueError::NotFound { ref value, .. } if value == "9"));
    }
}
