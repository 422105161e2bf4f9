use thiserror::Error;

/// Errors raised while building or decoding a job record.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job field '{field}' could not be decoded: {message}")]
    Decode { field: String, message: String },

    #[error("Invalid repeat options: {0}")]
    InvalidRepeat(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub fn decode(field: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Decode {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
