//! Store manager that dispatches to the configured backend.

use std::sync::Arc;

use tracing::info;

use crate::config::settings::{QueueConfig, StoreBackend, StoreConfig};
use crate::store::memory::MemoryStore;
use crate::store::redis::RedisStore;
use crate::store::{AtomicStore, StoreResult};

/// Owns the store backend of one queue.
///
/// Cloning is cheap; every clone shares the same backend, so a queue, its
/// workers and its scheduler built from one manager see the same structures
/// even with the in-memory backend.
#[derive(Clone)]
pub struct StoreManager {
    backend: Arc<dyn AtomicStore>,
    config: StoreConfig,
}

impl StoreManager {
    /// Create a store for `queue` with the given backend configuration.
    pub async fn new(config: StoreConfig, queue: &QueueConfig) -> StoreResult<Self> {
        let backend: Arc<dyn AtomicStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new(&queue.name, queue.events_max_len)),
            StoreBackend::Redis => Arc::new(
                RedisStore::new(&config.redis, &queue.name, queue.events_max_len).await?,
            ),
        };

        info!(
            queue = %queue.name,
            backend = ?config.backend,
            "Store backend ready"
        );

        Ok(Self { backend, config })
    }

    /// Wraps an already built backend.
    pub fn from_backend(backend: Arc<dyn AtomicStore>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Get a reference to the store backend.
    pub fn backend(&self) -> &Arc<dyn AtomicStore> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn queue_name(&self) -> &str {
        self.backend.queue_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobOptions, JobState};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_backend_is_shared_between_clones() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        let queue = QueueConfig {
            name: "mail".to_string(),
            ..Default::default()
        };
        let manager = StoreManager::new(config, &queue).await.unwrap();
        let clone = manager.clone();

        manager
            .backend()
            .enqueue(&Job::new("a", json!({}), JobOptions::default()))
            .await
            .unwrap();

        assert_eq!(clone.queue_name(), "mail");
        assert_eq!(clone.backend().count(JobState::Waiting).await.unwrap(), 1);
    }
}
