//! Atomic store adapter.
//!
//! Every queue structure (waiting, paused intake, delayed, priority, active,
//! completed, failed, stall marks, limiter windows, event log and the
//! repeatable index) lives behind [`AtomicStore`]. Two backends are provided:
//!
//! - [`MemoryStore`]: one mutex around all structures, single process only
//! - [`RedisStore`]: shared Redis server, one Lua script per transition
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! backend = "redis"  # or "memory"
//!
//! [store.redis]
//! url = "redis://127.0.0.1:6379"
//! pool_size = 8
//! connection_timeout = 5
//! key_prefix = "jobline"
//! ```

mod error;
mod keys;
mod manager;
mod memory;
mod redis;
mod scripts;
mod traits;
mod types;

pub use error::{StoreError, StoreResult};
pub use keys::QueueKeys;
pub use manager::StoreManager;
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use traits::AtomicStore;
pub use types::{
    AdmitRequest, AttemptRecord, DelayRequest, EventId, EventRecord, FinalizeRequest,
    LimiterSpec, Outcome, Promotion, RequeueRequest, STALLED_FAILURE_REASON, StalledReport,
    event_name,
};

// Re-export config types
pub use crate::config::settings::{RedisStoreConfig, StoreBackend, StoreConfig};
