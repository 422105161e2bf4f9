use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::ProcessorError;
use crate::jobs::Job;
use crate::worker::processor::{JobContext, Processor};

/// Routes jobs to processors by job name
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
    fallback: Option<Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for jobs named `name`
    pub fn register(&mut self, name: impl Into<String>, processor: Arc<dyn Processor>) -> &mut Self {
        self.processors.insert(name.into(), processor);
        self
    }

    /// Processor used for names nothing was registered for
    pub fn fallback(&mut self, processor: Arc<dyn Processor>) -> &mut Self {
        self.fallback = Some(processor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.get(name).or(self.fallback.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.processors.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Processor for ProcessorRegistry {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        // Retrying cannot make a processor appear, so the job fails at once.
        let processor = self.get(&job.name).ok_or_else(|| {
            ProcessorError::unrecoverable(format!("No processor registered for job '{}'", job.name))
        })?;
        processor.process(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobOptions;
    use crate::store::{AtomicStore, MemoryStore};
    use crate::worker::processor::processor_fn;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn context(job: &Job) -> JobContext {
        let store: Arc<dyn AtomicStore> = Arc::new(MemoryStore::new("registry", 100));
        JobContext::new(store, job, CancellationToken::new())
    }

    fn constant(value: JsonValue) -> Arc<dyn Processor> {
        processor_fn(move |_job: Job, _ctx: JobContext| {
            let value = value.clone();
            async move { Ok::<_, ProcessorError>(value) }
        })
    }

    #[tokio::test]
    async fn test_dispatches_by_name() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register("email", constant(json!("sent")))
            .register("resize", constant(json!("resized")));

        let job = Job::new("resize", json!({}), JobOptions::default());
        assert_eq!(registry.process(&job, &context(&job)).await.unwrap(), json!("resized"));
    }

    #[tokio::test]
    async fn test_unknown_name_is_unrecoverable() {
        let registry = ProcessorRegistry::new();
        let job = Job::new("missing", json!({}), JobOptions::default());
        let err = registry.process(&job, &context(&job)).await.unwrap_err();
        assert!(err.unrecoverable);
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_fallback_handles_unregistered_names() {
        let mut registry = ProcessorRegistry::new();
        registry.fallback(constant(json!("fallback")));
        let job = Job::new("anything", json!({}), JobOptions::default());
        assert_eq!(registry.process(&job, &context(&job)).await.unwrap(), json!("fallback"));
    }
}
