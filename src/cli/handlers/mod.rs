//! Command handlers for CLI operations
//!
//! This module contains handlers for different CLI commands,
//! separating command execution logic from parsing and validation.

pub mod admin;
pub mod check;
pub mod schedule;
pub mod work;

pub use admin::{AdminCommand, AdminCommandHandler};
pub use check::CheckCommandHandler;
pub use schedule::ScheduleCommandHandler;
pub use work::WorkCommandHandler;

use tokio::signal;

use crate::config::settings::Settings;
use crate::error::QueueResult;
use crate::store::StoreManager;

/// Connects to the store configured in `settings`.
pub(crate) async fn open_store(settings: &Settings) -> QueueResult<StoreManager> {
    Ok(StoreManager::new(settings.store.clone(), &settings.queue).await?)
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
