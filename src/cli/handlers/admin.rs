//! Admin command handler
//!
//! One-shot queue operations: add, pause, resume, clean, drain and retry.

use serde_json::Value as JsonValue;

use crate::cli::parser::Commands;
use crate::config::settings::Settings;
use crate::error::{QueueError, QueueResult};
use crate::jobs::{JobOptions, JobState, RepeatOptions};
use crate::queue::Queue;
use crate::store::StoreManager;

/// A one-shot operation on the queue
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Add {
        name: String,
        data: JsonValue,
        opts: JobOptions,
    },
    Pause,
    Resume,
    Clean {
        grace_ms: u64,
        limit: usize,
        state: JobState,
    },
    Drain {
        include_delayed: bool,
    },
    Retry {
        job_id: String,
        from: JobState,
    },
}

impl AdminCommand {
    /// The admin operation a parsed subcommand stands for, if any
    pub fn from_command(command: &Commands) -> Option<Self> {
        let admin = match command {
            Commands::Add {
                name,
                data,
                job_id,
                delay,
                attempts,
                priority,
                lifo,
                cron,
                every,
                tz,
                limit,
            } => {
                let repeat = (cron.is_some() || every.is_some()).then(|| RepeatOptions {
                    cron: cron.clone(),
                    every: *every,
                    tz: tz.clone(),
                    limit: *limit,
                    ..Default::default()
                });
                AdminCommand::Add {
                    name: name.clone(),
                    data: data.clone(),
                    opts: JobOptions {
                        job_id: job_id.clone(),
                        delay: *delay,
                        attempts: *attempts,
                        priority: *priority,
                        lifo: *lifo,
                        repeat,
                        ..Default::default()
                    },
                }
            }
            Commands::Pause => AdminCommand::Pause,
            Commands::Resume => AdminCommand::Resume,
            Commands::Clean { grace, limit, state } => AdminCommand::Clean {
                grace_ms: *grace,
                limit: *limit,
                state: *state,
            },
            Commands::Drain { delayed } => AdminCommand::Drain {
                include_delayed: *delayed,
            },
            Commands::Retry { job_id, from } => AdminCommand::Retry {
                job_id: job_id.clone(),
                from: *from,
            },
            Commands::Work { .. } | Commands::Schedule | Commands::Check => return None,
        };
        Some(admin)
    }
}

/// Handler for the admin commands
pub struct AdminCommandHandler {
    config: Settings,
    store: Option<StoreManager>,
}

impl AdminCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self {
            config,
            store: None,
        }
    }

    pub fn with_store(mut self, store: StoreManager) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs the operation and prints its outcome
    pub async fn execute(&self, command: AdminCommand) -> QueueResult<()> {
        let message = self.run(command).await?;
        println!("{}", message);
        Ok(())
    }

    /// Runs the operation and describes its outcome
    pub async fn run(&self, command: AdminCommand) -> QueueResult<String> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => super::open_store(&self.config).await?,
        };
        let queue = Queue::from_manager(&store, &self.config.queue);

        let message = match command {
            AdminCommand::Add { name, data, opts } => {
                let job = queue.add(name, data, opts).await?;
                match job.opts.repeat {
                    Some(_) => format!(
                        "Added repeatable job '{}', next occurrence {} due at {}",
                        job.name,
                        job.id,
                        job.due_at()
                    ),
                    None => format!("Added job {} to queue '{}'", job.id, queue.name()),
                }
            }
            AdminCommand::Pause => {
                queue.pause().await?;
                format!("Queue '{}' paused", queue.name())
            }
            AdminCommand::Resume => {
                queue.resume().await?;
                format!("Queue '{}' resumed", queue.name())
            }
            AdminCommand::Clean {
                grace_ms,
                limit,
                state,
            } => {
                let removed = queue.clean(grace_ms, limit, state).await?;
                format!("Removed {} {} jobs", removed.len(), state)
            }
            AdminCommand::Drain { include_delayed } => {
                let removed = queue.drain(include_delayed).await?;
                format!("Drained {} jobs", removed)
            }
            AdminCommand::Retry { job_id, from } => {
                if queue.get_job(&job_id).await?.is_none() {
                    return Err(QueueError::NotFound {
                        entity: "job".to_string(),
                        field: "id".to_string(),
                        value: job_id,
                    });
                }
                queue.retry_job(&job_id, from).await?;
                format!("Job {} moved back to waiting", job_id)
            }
        };
        Ok(message)
    }
}
