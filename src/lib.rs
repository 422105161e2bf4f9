//! Jobline
//!
//! A distributed job queue. Producers add jobs through [`Queue`], workers
//! claim and process them through [`Worker`], and the [`QueueScheduler`]
//! promotes delayed jobs and reclaims stalled ones. Every state move runs as
//! one atomic operation on the shared store.

use shadow_rs::shadow;
shadow!(build);

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logger;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod utils;
pub mod worker;

pub use error::{ProcessorError, QueueError, QueueResult};
pub use events::{EventCursor, QueueEvent, QueueEvents};
pub use jobs::{BackoffSpec, Job, JobId, JobOptions, JobState, RepeatOptions, Retention};
pub use queue::Queue;
pub use scheduler::QueueScheduler;
pub use store::{AtomicStore, MemoryStore, RedisStore, StoreManager};
pub use worker::{
    JobContext, Processor, ProcessorRegistry, SandboxedProcessor, Worker, WorkerEvent,
    WorkerOptions, processor_fn,
};

pub fn pkg_version() -> &'static str {
    build::PKG_VERSION
}

pub fn clap_long_version() -> &'static str {
    build::CLAP_LONG_VERSION
}
