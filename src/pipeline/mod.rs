//! Pipeline: configuration, stage execution and the run state machine.

mod config;
mod executor;
mod orchestrator;

pub use config::{ConfigError, PipelineConfig};
pub use executor::{AttemptRecord, ExecutorError, StageExecutor, StageOutcome};
pub use orchestrator::{PipelineError, PipelineOrchestrator};
