//! Command executor for dispatching CLI commands
//!
//! This module provides the main entry point for executing CLI commands
//! after parsing and configuration loading.

use super::handlers::{
    AdminCommand, AdminCommandHandler, CheckCommandHandler, ScheduleCommandHandler,
    WorkCommandHandler,
};
use super::parser::{Cli, Commands};
use crate::config::settings::Settings;
use crate::error::{QueueError, QueueResult};

/// Execute a CLI command with the given settings
///
/// Without a subcommand the configuration is checked, as `check` does.
///
/// # Errors
/// Returns errors from command handlers or validation failures
pub async fn execute_command(cli: &Cli, settings: Settings) -> QueueResult<()> {
    validate_command_args(cli)?;

    let Some(command) = &cli.command else {
        return CheckCommandHandler::new(settings).execute().await;
    };

    match command {
        Commands::Work {
            shell,
            with_scheduler,
            program,
            ..
        } => {
            WorkCommandHandler::new(settings)
                .execute(program, *shell, *with_scheduler)
                .await
        }
        Commands::Schedule => ScheduleCommandHandler::new(settings).execute().await,
        Commands::Check => CheckCommandHandler::new(settings).execute().await,
        admin => match AdminCommand::from_command(admin) {
            Some(admin) => AdminCommandHandler::new(settings).execute(admin).await,
            None => Err(QueueError::validation(
                "cli_arguments",
                "Command has no handler",
            )),
        },
    }
}

/// Validate command arguments before execution
fn validate_command_args(cli: &Cli) -> QueueResult<()> {
    cli.validate()
        .map_err(|reason| QueueError::validation("cli_arguments", reason))?;

    if let Some(Commands::Work {
        shell: false,
        program,
        ..
    }) = &cli.command
        && program.len() == 1
        && program[0].contains(char::is_whitespace)
    {
        tracing::warn!(
            program = %program[0],
            "Program contains whitespace; pass --shell to run it as a shell script"
        );
    }

    Ok(())
}
