//! draftforge: turn a source document into a fact-checked, graded
//! article through a pipeline of LLM stages.
//!
//! Stage order is research, write, fact_check (bounded retry loop),
//! polish, rubric (quality gate with rollback to write). Every
//! transition is persisted to a local JSON run store before the next
//! stage starts; an optional Postgres mirror records steps, generation
//! calls and rubric outcomes for analysis. Finished runs accept
//! feedback that re-enters the pipeline at a chosen stage while
//! preserving everything upstream.

pub mod cli;
pub mod error;
pub mod llm;
pub mod parse;
pub mod pipeline;
pub mod quality;
pub mod run;
pub mod service;
pub mod stages;
pub mod store;

pub use error::{LlmError, ParseError};
pub use pipeline::{PipelineConfig, PipelineOrchestrator};
pub use run::{RunInputs, RunState, RunStatus};
pub use service::{RunService, ServiceError};
