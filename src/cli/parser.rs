//! CLI argument parsing with clap
//!
//! This module defines the command-line interface structure using clap,
//! including all commands, arguments, and their documentation.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value as JsonValue;
use std::path::PathBuf;

use crate::jobs::JobState;

// Include shadow-rs generated build information
use shadow_rs::shadow;
shadow!(build);

/// Distributed job queue backed by Redis
#[derive(Parser, Debug)]
#[command(name = "jobline")]
#[command(about = "Distributed job queue backed by Redis")]
#[command(long_about = "
Jobline runs the worker and scheduler processes of a Redis-backed job queue
and offers the admin operations producers and operators need.

EXAMPLES:
    # Process jobs with a child process per job
    jobline work -- ./bin/resize-image

    # Same, through a shell script and with 8 slots
    jobline work --concurrency 8 --shell -- 'python3 worker.py'

    # Run the delay promoter and stalled-job reaper
    jobline schedule

    # Add a job delayed by 5 seconds with 3 attempts
    jobline add resize --data '{\"path\":\"a.png\"}' --delay 5000 --attempts 3

    # Register a repeatable job
    jobline add report --cron '0 3 * * *' --tz Europe/Paris

    # Retry a failed job
    jobline retry 42

    # Validate configuration without touching the store
    jobline check
")]
#[command(version = build::CLAP_LONG_VERSION)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    ///
    /// Load this single TOML file instead of the layered configuration
    /// directory. The file must exist and be readable.
    ///
    /// Example: --config /etc/jobline/production.toml
    #[arg(short, long, value_name = "FILE", value_parser = super::validation::validate_config_file_path)]
    pub config: Option<PathBuf>,

    /// Override environment detection
    ///
    /// Selects which `{environment}.toml` is layered over `default.toml`.
    ///
    /// Available values: development (dev), staging (stage), production (prod), test
    #[arg(short, long, value_enum)]
    pub env: Option<Environment>,

    /// Queue to operate on, overriding `queue.name`
    #[arg(long, value_name = "NAME", value_parser = super::validation::validate_queue_name)]
    pub queue: Option<String>,

    /// Enable verbose logging
    ///
    /// Increases log output to debug level. Cannot be used with --quiet.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-error output
    ///
    /// Reduces log output to error level only. Cannot be used with --verbose.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker that hands every job to a child process
    ///
    /// The child receives `{"cmd":"start","job":{...}}` on stdin and answers
    /// with JSON lines on stdout (`completed`, `failed`, `progress`, `log`).
    ///
    /// Examples:
    ///   jobline work -- ./bin/handler --fast
    ///   jobline work --shell -- 'node handler.js'
    ///   jobline work --with-scheduler -- ./bin/handler
    Work {
        /// Number of jobs processed at the same time
        #[arg(long, value_name = "N", value_parser = super::validation::validate_concurrency)]
        concurrency: Option<usize>,

        /// Run the program through `sh -c`
        #[arg(long)]
        shell: bool,

        /// Also run the delay promoter and stalled-job reaper in this process
        #[arg(long)]
        with_scheduler: bool,

        /// Program run for each job, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, value_name = "PROGRAM")]
        program: Vec<String>,
    },

    /// Run the delay promoter and the stalled-job reaper
    Schedule,

    /// Add a job to the queue
    ///
    /// Examples:
    ///   jobline add email --data '{"to":"a@b.c"}'
    ///   jobline add cleanup --every 60000 --limit 10
    Add {
        /// Job name
        name: String,

        /// Job payload as JSON
        #[arg(long, value_name = "JSON", default_value = "{}", value_parser = super::validation::validate_json)]
        data: JsonValue,

        /// Custom job id
        #[arg(long, value_name = "ID")]
        job_id: Option<String>,

        /// Delay in milliseconds before the job becomes waiting
        #[arg(long, value_name = "MS")]
        delay: Option<u64>,

        /// Total number of attempts
        #[arg(long, value_name = "N", value_parser = super::validation::validate_attempts)]
        attempts: Option<u32>,

        /// Priority, 1 is the highest
        #[arg(long, value_name = "N")]
        priority: Option<u32>,

        /// Add to the head of the wait list
        #[arg(long)]
        lifo: bool,

        /// Repeat on a cron pattern
        #[arg(long, value_name = "PATTERN", conflicts_with = "every")]
        cron: Option<String>,

        /// Repeat every N milliseconds
        #[arg(long, value_name = "MS")]
        every: Option<u64>,

        /// Timezone the cron pattern is evaluated in
        #[arg(long, value_name = "TZ", requires = "cron")]
        tz: Option<String>,

        /// Maximum number of repetitions
        #[arg(long, value_name = "N")]
        limit: Option<u32>,
    },

    /// Stop admission of new jobs on every worker of the queue
    Pause,

    /// Resume a paused queue
    Resume,

    /// Remove old jobs in one state
    ///
    /// Examples:
    ///   jobline clean --state completed --grace 3600000
    ///   jobline clean --state failed --limit 100
    Clean {
        /// Keep jobs newer than this many milliseconds
        #[arg(long, value_name = "MS", default_value_t = 0)]
        grace: u64,

        /// Maximum number of jobs removed, 0 removes all
        #[arg(long, value_name = "N", default_value_t = 0)]
        limit: usize,

        /// State to clean
        #[arg(long, value_name = "STATE", default_value = "completed", value_parser = super::validation::validate_job_state)]
        state: JobState,
    },

    /// Remove every waiting job
    Drain {
        /// Remove delayed jobs too
        #[arg(long)]
        delayed: bool,
    },

    /// Move a finished job back to waiting
    Retry {
        /// Job id
        job_id: String,

        /// State the job is expected to be in
        #[arg(long, value_name = "STATE", default_value = "failed", value_parser = super::validation::validate_finished_state)]
        from: JobState,
    },

    /// Validate configuration and exit
    ///
    /// Loads and validates the merged configuration without connecting to
    /// the store. Returns exit code 0 if valid, non-zero if invalid.
    Check,
}

/// Environment options
#[derive(ValueEnum, Clone, Debug)]
pub enum Environment {
    #[value(name = "development", alias = "dev")]
    Development,
    #[value(name = "staging", alias = "stage")]
    Staging,
    #[value(name = "production", alias = "prod")]
    Production,
    #[value(name = "test")]
    Test,
}

impl Cli {
    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if let Some(Commands::Add {
            cron,
            every,
            limit,
            delay,
            ..
        }) = &self.command
        {
            let repeats = cron.is_some() || every.is_some();
            if limit.is_some() && !repeats {
                return Err("--limit needs --cron or --every".to_string());
            }
            if repeats && delay.is_some() {
                return Err("--delay cannot be combined with a repeat schedule".to_string());
            }
            if *every == Some(0) {
                return Err("--every must be greater than 0".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use --verbose and --quiet together".to_string());
        }

        Ok(())
    }
}

impl From<Environment> for crate::config::Environment {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Development => crate::config::Environment::Development,
            Environment::Staging => crate::config::Environment::Staging,
            Environment::Production => crate::config::Environment::Production,
            Environment::Test => crate::config::Environment::Test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_flag() {
        let err = Cli::try_parse_from(["jobline", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["jobline", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_default_behavior() {
        let cli = Cli::try_parse_from(["jobline"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(!cli.quiet);
        assert!(cli.config.is_none());
        assert!(cli.env.is_none());
        assert!(cli.queue.is_none());
    }

    #[test]
    fn test_work_command_takes_program_and_args() {
        let cli = Cli::try_parse_from([
            "jobline",
            "work",
            "--concurrency",
            "4",
            "--",
            "./handler",
            "--fast",
        ])
        .unwrap();
        let Some(Commands::Work {
            concurrency,
            shell,
            with_scheduler,
            program,
        }) = cli.command
        else {
            panic!("Expected Work command");
        };
        assert_eq!(concurrency, Some(4));
        assert!(!shell);
        assert!(!with_scheduler);
        assert_eq!(program, vec!["./handler", "--fast"]);
    }

    #[test]
    fn test_work_requires_program() {
        assert!(Cli::try_parse_from(["jobline", "work"]).is_err());
    }

    #[test]
    fn test_add_command() {
        let cli = Cli::try_parse_from([
            "jobline",
            "add",
            "email",
            "--data",
            r#"{"to":"a@b.c"}"#,
            "--attempts",
            "3",
            "--delay",
            "500",
        ])
        .unwrap();
        let Some(Commands::Add {
            name,
            data,
            attempts,
            delay,
            lifo,
            ..
        }) = cli.command
        else {
            panic!("Expected Add command");
        };
        assert_eq!(name, "email");
        assert_eq!(data, json!({"to": "a@b.c"}));
        assert_eq!(attempts, Some(3));
        assert_eq!(delay, Some(500));
        assert!(!lifo);
    }

    #[test]
    fn test_add_rejects_invalid_json() {
        assert!(Cli::try_parse_from(["jobline", "add", "x", "--data", "{oops"]).is_err());
    }

    #[test]
    fn test_add_cron_and_every_conflict() {
        let err = Cli::try_parse_from(["jobline", "add", "x", "--cron", "* * * * *", "--every", "10"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_limit_without_repeat_is_rejected() {
        let cli = Cli::try_parse_from(["jobline", "add", "x", "--limit", "3"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["jobline", "add", "x", "--every", "1000", "--limit", "3"]).unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_clean_defaults() {
        let cli = Cli::try_parse_from(["jobline", "clean"]).unwrap();
        let Some(Commands::Clean { grace, limit, state }) = cli.command else {
            panic!("Expected Clean command");
        };
        assert_eq!(grace, 0);
        assert_eq!(limit, 0);
        assert_eq!(state, JobState::Completed);
    }

    #[test]
    fn test_retry_only_from_finished_states() {
        let cli = Cli::try_parse_from(["jobline", "retry", "7", "--from", "completed"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Retry { ref job_id, from: JobState::Completed }) if job_id == "7"
        ));
        assert!(Cli::try_parse_from(["jobline", "retry", "7", "--from", "waiting"]).is_err());
    }

    #[test]
    fn test_env_alias() {
        let cli = Cli::try_parse_from(["jobline", "--env", "prod", "check"]).unwrap();
        assert!(matches!(cli.env, Some(Environment::Production)));
    }

    #[test]
    fn test_conflicting_verbose_quiet() {
        let err = Cli::try_parse_from(["jobline", "--verbose", "--quiet"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
