// Permit intake and per-relayer sequential processing
pub mod processor;
pub mod queue;

pub use processor::{PermitProcessor, ProcessOutcome, ProcessorConfig};
pub use queue::PermitQueue;
