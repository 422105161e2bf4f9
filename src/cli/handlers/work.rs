//! Work command handler
//!
//! Runs a worker whose processor is a child process per job, optionally
//! together with the scheduler, until a shutdown signal arrives.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::config::settings::Settings;
use crate::error::{QueueError, QueueResult};
use crate::scheduler::QueueScheduler;
use crate::store::StoreManager;
use crate::worker::{SandboxedProcessor, Worker, WorkerEvent, WorkerOptions};

/// Handler for the work command
pub struct WorkCommandHandler {
    config: Settings,
    store: Option<StoreManager>,
}

impl WorkCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Use an already connected store instead of opening one from the settings
    pub fn with_store(mut self, store: StoreManager) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the child-process processor from the command line
    pub fn processor(program: &[String], shell: bool) -> QueueResult<SandboxedProcessor> {
        let Some((first, rest)) = program.split_first() else {
            return Err(QueueError::validation("program", "A program to run is required"));
        };
        if shell {
            return Ok(SandboxedProcessor::shell(program.join(" ")));
        }
        Ok(SandboxedProcessor::new(first).with_args(rest.iter().cloned()))
    }

    /// Runs until Ctrl+C or SIGTERM
    pub async fn execute(&self, program: &[String], shell: bool, with_scheduler: bool) -> QueueResult<()> {
        self.execute_until(program, shell, with_scheduler, super::shutdown_signal())
            .await
    }

    /// Runs until `shutdown` resolves, then closes gracefully
    pub async fn execute_until(
        &self,
        program: &[String],
        shell: bool,
        with_scheduler: bool,
        shutdown: impl Future<Output = ()>,
    ) -> QueueResult<()> {
        let processor = Self::processor(program, shell)?;
        let store = match &self.store {
            Some(store) => store.clone(),
            None => super::open_store(&self.config).await?,
        };

        let scheduler = if with_scheduler {
            let scheduler = QueueScheduler::new(
                Arc::clone(store.backend()),
                self.config.scheduler.clone(),
            )?;
            let running = scheduler.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = running.run().await {
                    error!(error = %e, "Scheduler stopped with an error");
                }
            });
            Some((scheduler, task))
        } else {
            None
        };

        let options = WorkerOptions::from_config(&self.config.worker);
        let worker = Worker::new(Arc::clone(store.backend()), options, Arc::new(processor))?;
        let mut events = worker.events();
        let reporter = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Worker event reporter lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match event {
                    WorkerEvent::Completed { job_id, .. } => info!(job_id = %job_id, "Job completed"),
                    WorkerEvent::Failed {
                        job_id,
                        reason,
                        final_attempt,
                    } => info!(job_id = %job_id, reason = %reason, final_attempt, "Job failed"),
                    WorkerEvent::Error { job_id, message } => {
                        error!(job_id = ?job_id, message = %message, "Worker error")
                    }
                    WorkerEvent::Closed => break,
                    _ => {}
                }
            }
        });

        worker.run().await?;
        info!(
            queue = %store.queue_name(),
            worker = %worker.id(),
            program = %program.join(" "),
            "Worker running, waiting for shutdown signal"
        );

        shutdown.await;

        let closed = worker.close(false).await;
        // The reporter ends once the last sender goes away.
        drop(worker);
        if let Some((scheduler, task)) = scheduler {
            scheduler.close();
            let _ = task.await;
        }
        let _ = reporter.await;
        closed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::settings::StoreConfig;
    use crate::jobs::{JobOptions, JobState};
    use crate::queue::Queue;
    use crate::store::{AtomicStore, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn memory_store() -> StoreManager {
        let backend: Arc<dyn AtomicStore> = Arc::new(MemoryStore::new("work", 100));
        StoreManager::from_backend(backend, StoreConfig::default())
    }

    #[test]
    fn test_processor_from_program() {
        assert!(WorkCommandHandler::processor(&[], false).is_err());
        assert!(WorkCommandHandler::processor(&["./handler".to_string()], false).is_ok());
    }

    #[tokio::test]
    async fn test_work_processes_until_shutdown() {
        let store = memory_store();
        let queue = Queue::new(Arc::clone(store.backend()), JobOptions::default());
        let job = queue.add("echo", json!({"n": 1}), JobOptions::default()).await.unwrap();

        let mut settings = Settings::default();
        settings.worker.drain_delay_secs = 1;
        let handler = WorkCommandHandler::new(settings).with_store(store);

        let program = vec![r#"read start; echo '{"cmd":"completed","value":"done"}'"#.to_string()];
        let watched = queue.clone();
        let job_id = job.id.clone();
        let shutdown = async move {
            for _ in 0..100 {
                if watched.get_job_state(&job_id).await.unwrap() == JobState::Completed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };

        handler
            .execute_until(&program, true, true, shutdown)
            .await
            .unwrap();

        let stored = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.return_value, Some(json!("done")));
    }
}
