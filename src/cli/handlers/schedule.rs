//! Schedule command handler
//!
//! Runs the delay promoter and the stalled-job reaper until a shutdown
//! signal arrives.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::settings::Settings;
use crate::error::{QueueError, QueueResult};
use crate::scheduler::QueueScheduler;
use crate::store::StoreManager;

/// Handler for the schedule command
pub struct ScheduleCommandHandler {
    config: Settings,
    store: Option<StoreManager>,
}

impl ScheduleCommandHandler {
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

    pub async fn execute(&self) -> QueueResult<()> {
        self.execute_until(super::shutdown_signal()).await
    }

    pub async fn execute_until(&self, shutdown: impl Future<Output = ()>) -> QueueResult<()> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => super::open_store(&self.config).await?,
        };
        let scheduler = QueueScheduler::new(Arc::clone(store.backend()), self.config.scheduler.clone())?;

        let running = scheduler.clone();
        let task = tokio::spawn(async move { running.run().await });

        shutdown.await;
        info!(queue = %store.queue_name(), "Stopping scheduler");
        scheduler.close();

        task.await.map_err(|e| QueueError::Internal {
            source: anyhow::Error::from(e),
        })?
    }
}
