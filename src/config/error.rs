//! Errors raised while loading or validating jobline settings

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required file of the layered lookup is missing
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// The merged sources do not deserialize into `Settings`
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A setting is out of range; `field` is the dotted path, e.g. `worker.concurrency`
    #[error("Validation error: {field} - {message}")]
    ValidationError { field: String, message: String },

    /// `JOBLINE_APP_ENV` names no known environment
    #[error(
        "Invalid environment '{value}'. Valid values are: development, test, staging, production"
    )]
    InvalidEnvironment { value: String },

    /// `JOBLINE_CONFIG_DIR` and `JOBLINE_CONFIG_FILE` were both set
    #[error("Mutual exclusivity error: {0}")]
    MutualExclusivityError(String),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}
