//! CLI argument validation functions
//!
//! This module provides custom validation functions for CLI arguments
//! that go beyond what clap can validate automatically.

use std::fs;
use std::path::PathBuf;

use serde_json::Value as JsonValue;

use crate::jobs::JobState;

/// Validate that a file path is accessible (exists and is readable)
pub fn validate_config_file_path(path_str: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(format!("Configuration file does not exist: '{}'", path_str));
    }

    if !path.is_file() {
        return Err(format!("Configuration path is not a file: '{}'", path_str));
    }

    match fs::File::open(&path) {
        Ok(_) => Ok(path),
        Err(e) => Err(format!("Cannot read configuration file '{}': {}", path_str, e)),
    }
}

/// Validate a queue name; it becomes part of every store key
pub fn validate_queue_name(name: &str) -> Result<String, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Queue name cannot be empty".to_string());
    }
    if name.contains(':') || name.contains(char::is_whitespace) {
        return Err(format!(
            "Queue name cannot contain ':' or whitespace, got: '{}'",
            name
        ));
    }
    Ok(name.to_string())
}

/// Validate concurrency is a positive number
pub fn validate_concurrency(value: &str) -> Result<usize, String> {
    let concurrency: usize = value
        .parse()
        .map_err(|_| format!("Concurrency must be a positive number, got: '{}'", value))?;

    if concurrency == 0 {
        return Err("Concurrency must be greater than 0".to_string());
    }

    Ok(concurrency)
}

pub fn validate_attempts(value: &str) -> Result<u32, String> {
    let attempts: u32 = value
        .parse()
        .map_err(|_| format!("Attempts must be a positive number, got: '{}'", value))?;

    if attempts == 0 {
        return Err("Attempts must be greater than 0".to_string());
    }

    Ok(attempts)
}

/// Parse a JSON document given on the command line
pub fn validate_json(value: &str) -> Result<JsonValue, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {}", e))
}

pub fn validate_job_state(value: &str) -> Result<JobState, String> {
    let state: JobState = value.parse().map_err(|e| format!("{}", e))?;
    if state == JobState::Unknown {
        return Err("State 'unknown' is not a list jobs can be taken from".to_string());
    }
    Ok(state)
}

/// Only completed and failed jobs can be retried
pub fn validate_finished_state(value: &str) -> Result<JobState, String> {
    let state = validate_job_state(value)?;
    if !state.is_finished() {
        return Err(format!(
            "Expected 'completed' or 'failed', got: '{}'",
            value
        ));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[test]
    fn test_validate_config_file_path() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(validate_config_file_path(path).unwrap(), file.path());

        assert!(validate_config_file_path("/nonexistent/jobline.toml").is_err());

        let dir = tempfile::tempdir().unwrap();
        let err = validate_config_file_path(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.contains("not a file"));
    }

    #[test]
    fn test_validate_queue_name() {
        assert_eq!(validate_queue_name(" emails ").unwrap(), "emails");
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("a:b").is_err());
        assert!(validate_queue_name("a b").is_err());
    }

    #[test]
    fn test_validate_concurrency() {
        assert_eq!(validate_concurrency("8").unwrap(), 8);
        assert!(validate_concurrency("0").is_err());
        assert!(validate_concurrency("-1").is_err());
        assert!(validate_concurrency("many").is_err());
    }

    #[test]
    fn test_validate_attempts() {
        assert_eq!(validate_attempts("3").unwrap(), 3);
        assert!(validate_attempts("0").is_err());
    }

    #[test]
    fn test_validate_json() {
        assert_eq!(validate_json(r#"{"a":[1,2]}"#).unwrap(), json!({"a": [1, 2]}));
        assert_eq!(validate_json("42").unwrap(), json!(42));
        assert!(validate_json("{a:1}").is_err());
    }

    #[test]
    fn test_validate_job_state() {
        assert_eq!(validate_job_state("wait").unwrap(), JobState::Waiting);
        assert_eq!(validate_job_state("FAILED").unwrap(), JobState::Failed);
        assert!(validate_job_state("unknown").is_err());
        assert!(validate_job_state("done").is_err());
    }

    #[test]
    fn test_validate_finished_state() {
        assert_eq!(validate_finished_state("completed").unwrap(), JobState::Completed);
        assert!(validate_finished_state("delayed").is_err());
    }
}
