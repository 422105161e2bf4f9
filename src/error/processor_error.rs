use thiserror::Error;

/// Failure returned by a processor for one job execution.
///
/// Drives the retry decision: the message becomes the job's failure reason and
/// the stack (or the message when there is none) is appended to its
/// stacktrace list. An unrecoverable error fails the job without retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessorError {
    pub message: String,
    pub stack: Option<String>,
    pub unrecoverable: bool,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            unrecoverable: false,
        }
    }

    /// An error that skips any remaining attempts.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            unrecoverable: true,
            ..Self::new(message)
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Text recorded in the job's stacktrace list.
    pub fn trace(&self) -> String {
        self.stack.clone().unwrap_or_else(|| self.message.clone())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: Some(format!("{:?}", error)),
            unrecoverable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_falls_back_to_message() {
        assert_eq!(ProcessorError::new("boom").trace(), "boom");
        assert_eq!(
            ProcessorError::new("boom").with_stack("at line 1").trace(),
            "at line 1"
        );
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err: ProcessorError = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.message, "outer");
        assert!(err.stack.unwrap().contains("inner"));
        assert!(!err.unrecoverable);
    }
}
