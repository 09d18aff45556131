pub mod cancel;
pub mod fetcher;
pub mod filters;
pub mod orchestrator;
pub mod pool;
pub mod screener;

pub use cancel::CancelSignal;
pub use orchestrator::{Pipeline, PipelineConfig, PipelineCounts, PipelineResult};
