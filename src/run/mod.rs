//! Run state model and citation accounting.

pub mod citations;
mod types;

pub use types::{
    Citation, DraftIteration, FactCheckIteration, FeedbackRecord, FinalArtifact, Issue,
    QualityGateSummary, ResearchFindings, RubricEvaluation, RubricScores, RubricThresholds,
    RunInputs, RunState, RunStatus, StepRecords,
};
