//! Store adapter error types.

use thiserror::Error;

use crate::jobs::{JobError, JobState};

/// Errors that can occur while running an atomic store operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store operation failed: {0}")]
    Operation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing key for job {job_id} ({command})")]
    MissingJobKey { job_id: String, command: String },

    #[error("Missing lock for job {job_id} ({command})")]
    MissingLease { job_id: String, command: String },

    #[error("Job {job_id} does not exist")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is currently active")]
    JobIsActive { job_id: String },

    #[error("Job {job_id} is not in the {state} state")]
    JobNotInState { job_id: String, state: JobState },
}

impl StoreError {
    /// Interprets the negative status codes returned by lease-checked operations.
    pub fn from_code(code: i64, job_id: &str, command: &str) -> Option<Self> {
        match code {
            -1 => Some(StoreError::MissingJobKey {
                job_id: job_id.to_string(),
                command: command.to_string(),
            }),
            -2 => Some(StoreError::MissingLease {
                job_id: job_id.to_string(),
                command: command.to_string(),
            }),
            _ => None,
        }
    }

    /// Interprets the status code of a retry request.
    pub fn from_retry_code(code: i64, job_id: &str, state: JobState) -> Option<Self> {
        match code {
            0 => Some(StoreError::JobNotFound {
                job_id: job_id.to_string(),
            }),
            -1 => Some(StoreError::JobIsActive {
                job_id: job_id.to_string(),
            }),
            -2 => Some(StoreError::JobNotInState {
                job_id: job_id.to_string(),
                state,
            }),
            _ => None,
        }
    }
}

impl From<JobError> for StoreError {
    fn from(error: JobError) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
