//! Job entity: data model, options, backoff and the stored hash form.

pub mod backoff;
pub mod error;
pub mod options;
pub mod types;

pub use backoff::{BackoffSpec, BackoffStrategies, BackoffStrategy, NO_RETRY};
pub use error::{JobError, JobResult};
pub use options::{JobOptions, RepeatOptions, Retention};
pub use types::{Job, JobId, JobState, delayed_score, due_from_score, id_sequence};
