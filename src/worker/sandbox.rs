//! Processor running each job in a child process.
//!
//! The worker writes one `{"cmd":"start","job":{...}}` line to the child's
//! stdin and reads JSON lines back from its stdout:
//!
//! ```text
//! {"cmd":"progress","value":50}
//! {"cmd":"log","value":"resized 3 images"}
//! {"cmd":"completed","value":{"ok":true}}
//! {"cmd":"failed","value":{"message":"bad input","stack":"..."}}
//! ```
//!
//! `error` is accepted as a synonym of `failed`. A child that exits before
//! reporting an outcome fails the job with its exit code or signal.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ProcessorError;
use crate::jobs::Job;
use crate::worker::processor::{JobContext, Processor};

#[derive(Serialize)]
struct StartMessage<'a> {
    cmd: &'static str,
    job: &'a Job,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum ChildMessage {
    Completed {
        #[serde(default)]
        value: JsonValue,
    },
    #[serde(alias = "error")]
    Failed {
        #[serde(default)]
        value: JsonValue,
    },
    Progress {
        #[serde(default)]
        value: JsonValue,
    },
    Log {
        #[serde(default)]
        value: JsonValue,
    },
}

/// Spawns `program args..` once per job.
#[derive(Debug, Clone)]
pub struct SandboxedProcessor {
    program: PathBuf,
    args: Vec<String>,
}

impl SandboxedProcessor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Runs the job through `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").with_args(["-c".to_string(), script.into()])
    }

    async fn handle(&self, message: ChildMessage, ctx: &JobContext) -> Option<Result<JsonValue, ProcessorError>> {
        match message {
            ChildMessage::Completed { value } => Some(Ok(value)),
            ChildMessage::Failed { value } => Some(Err(failure_from(value))),
            ChildMessage::Progress { value } => {
                if let Err(e) = ctx.update_progress(value).await {
                    warn!(job_id = %ctx.job_id, error = %e, "Failed to store progress from child");
                }
                None
            }
            ChildMessage::Log { value } => {
                let line = match value {
                    JsonValue::String(line) => line,
                    other => other.to_string(),
                };
                if let Err(e) = ctx.log(line).await {
                    warn!(job_id = %ctx.job_id, error = %e, "Failed to store log line from child");
                }
                None
            }
        }
    }
}

/// A failure value is either a bare message or `{message, stack}`.
fn failure_from(value: JsonValue) -> ProcessorError {
    match value {
        JsonValue::String(message) => ProcessorError::new(message),
        JsonValue::Object(map) => {
            let message = map
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("child process reported a failure")
                .to_string();
            let error = ProcessorError::new(message);
            match map.get("stack").and_then(JsonValue::as_str) {
                Some(stack) => error.with_stack(stack),
                None => error,
            }
        }
        JsonValue::Null => ProcessorError::new("child process reported a failure"),
        other => ProcessorError::new(other.to_string()),
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    "unknown status".to_string()
}

#[async_trait]
impl Processor for SandboxedProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessorError::new(format!(
                    "Failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ProcessorError::new("Child process stdio is not available"));
        };

        let job_id = ctx.job_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(job_id = %job_id, "child stderr: {}", line);
            }
        });

        let mut start = serde_json::to_string(&StartMessage { cmd: "start", job })
            .map_err(|e| ProcessorError::new(format!("Failed to encode job: {}", e)))?;
        start.push('\n');
        // A child that never reads stdin may already be gone; its exit is reported below.
        if let Err(e) = stdin.write_all(start.as_bytes()).await {
            debug!(job_id = %ctx.job_id, error = %e, "Failed to write start message");
        }
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChildMessage>(line) {
                        Ok(message) => {
                            if let Some(outcome) = self.handle(message, ctx).await {
                                return outcome;
                            }
                        }
                        Err(_) => debug!(job_id = %ctx.job_id, "child stdout: {}", line),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = %ctx.job_id, error = %e, "Failed to read child output");
                    break;
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ProcessorError::new(format!("Failed to wait for child process: {}", e)))?;
        Err(ProcessorError::new(format!(
            "Unexpected exit of child process: {}",
            describe_exit(status)
        )))
    }
}
