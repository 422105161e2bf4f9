mod processor_error;
mod queue_error;
mod store_converter;

pub use processor_error::ProcessorError;
pub use queue_error::{QueueError, QueueResult};
pub use store_converter::StoreErrorConverter;
