//! Harvest pipeline and storage sinks.

pub mod pipeline;
pub mod sink;

pub use pipeline::{HarvestPipeline, HarvestReport, HarvestResult, HarvestTask};
pub use sink::{HarvestBatch, JsonFileSink, MemorySink, StorageSink};
