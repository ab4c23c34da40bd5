//! Run state: the single JSON document that records everything a run
//! has produced. Stage outputs are append-only; revision loops add new
//! iterations instead of replacing earlier ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stages::StageName;

/// Lifecycle status of a run.
///
/// Forward-only, with two permitted backward edges: the rubric gate
/// rolling a `RUNNING` run back into the write loop, and feedback
/// reopening a terminal run to `RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    DoneWithWarnings,
    Error,
}

impl RunStatus {
    /// Terminal states accept feedback; non-terminal states reject it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::DoneWithWarnings | RunStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Done => "DONE",
            RunStatus::DoneWithWarnings => "DONE_WITH_WARNINGS",
            RunStatus::Error => "ERROR",
        }
    }
}

/// What the caller supplied when the run was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInputs {
    /// Extracted text of the source document.
    pub source_text: String,
    /// Working title for the artifact.
    pub title: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Target length of the final artifact in words.
    #[serde(default = "default_word_count")]
    pub target_word_count: u32,
    #[serde(default)]
    pub additional_instructions: String,
}

fn default_tone() -> String {
    "professional".to_string()
}

fn default_audience() -> String {
    "technical readers".to_string()
}

fn default_word_count() -> u32 {
    1200
}

/// A source the research stage surfaced. `S0` always denotes the
/// source document itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Marker id, e.g. "S0", "S1".
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Short supporting excerpt, when the model provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Citation {
    /// The implicit citation for the source document itself.
    pub fn source_document() -> Self {
        Self {
            id: "S0".to_string(),
            title: "Source document".to_string(),
            url: None,
            snippet: None,
        }
    }
}

/// Output of the research stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchFindings {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub sources: Vec<Citation>,
    /// True when the model output failed structural validation and the
    /// findings were synthesized from the source document instead.
    #[serde(default)]
    pub synthesized: bool,
}

/// One produced draft. Iterations are 1-based and strictly increasing
/// across the whole run, including rubric rollbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftIteration {
    pub iteration: u32,
    pub content: String,
    pub word_count: u32,
    /// Instructions this draft was asked to address, if it is a revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A factual problem the verifier found in a draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub claim: String,
    pub reason: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub source_ids: Vec<String>,
}

/// One fact-check verdict, paired by index order with the draft it
/// examined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckIteration {
    pub iteration: u32,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Rewrite guidance assembled from the issues, fed to the next draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The polished artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub markdown: String,
    pub word_count: u32,
    /// Count of `[S#]` citation markers in the markdown.
    pub citation_markers: u32,
    pub created_at: DateTime<Utc>,
}

/// Rubric scores on a 1.0 to 5.0 scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RubricScores {
    pub clarity: f64,
    pub correctness: f64,
    pub completeness: f64,
    pub overall: f64,
}

/// Minimum acceptable score per dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RubricThresholds {
    pub clarity: f64,
    pub correctness: f64,
    pub completeness: f64,
    pub overall: f64,
}

impl Default for RubricThresholds {
    fn default() -> Self {
        Self {
            clarity: 3.0,
            correctness: 4.0,
            completeness: 3.0,
            overall: 3.5,
        }
    }
}

/// Outcome of one rubric evaluation. The thresholds in force travel
/// with the evaluation so later readers need no external context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricEvaluation {
    pub scores: RubricScores,
    pub thresholds: RubricThresholds,
    pub passed: bool,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// 1-based evaluation attempt within this run.
    pub attempt: u32,
    pub grader_model: String,
    pub created_at: DateTime<Utc>,
}

/// All stage outputs of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecords {
    pub research: Option<ResearchFindings>,
    #[serde(default)]
    pub drafts: Vec<DraftIteration>,
    #[serde(default)]
    pub fact_checks: Vec<FactCheckIteration>,
    #[serde(rename = "final")]
    pub final_output: Option<FinalArtifact>,
    pub rubric: Option<RubricEvaluation>,
}

/// Loop outcomes recorded when a run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateSummary {
    pub fact_check_passed: bool,
    pub fact_check_attempts: u32,
    pub rubric_passed: bool,
    pub rubric_attempts: u32,
    /// Set when the rubric retry budget ran out without a pass.
    pub review_required: bool,
}

/// A feedback submission that reopened the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub stage: StageName,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// The complete persisted state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: Uuid,
    pub status: RunStatus,
    pub inputs: RunInputs,
    #[serde(default)]
    pub steps: StepRecords,
    /// Immutable after the research stage completes.
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub quality_gate: Option<QualityGateSummary>,
    /// Total rubric evaluations over the run's lifetime, feedback
    /// re-entries included. Keeps attempt numbers strictly increasing
    /// even though `steps.rubric` only holds the latest evaluation.
    #[serde(default)]
    pub rubric_attempt_count: u32,
    #[serde(default)]
    pub feedback: Vec<FeedbackRecord>,
    /// Failure message when `status == ERROR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// A fresh `PENDING` run around the given inputs.
    pub fn new(inputs: RunInputs) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            inputs,
            steps: StepRecords::default(),
            citations: Vec::new(),
            quality_gate: None,
            rubric_attempt_count: 0,
            feedback: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent draft, if any exist.
    pub fn latest_draft(&self) -> Option<&DraftIteration> {
        self.steps.drafts.last()
    }

    /// Next iteration number for a draft, derived from stored history
    /// so numbers stay strictly increasing across rollbacks and feedback.
    pub fn next_draft_iteration(&self) -> u32 {
        self.steps.drafts.len() as u32 + 1
    }

    /// Next iteration number for a fact-check verdict.
    pub fn next_fact_check_iteration(&self) -> u32 {
        self.steps.fact_checks.len() as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RunInputs {
        RunInputs {
            source_text: "The product launches in Q3.".to_string(),
            title: "Launch plan".to_string(),
            tone: default_tone(),
            audience: default_audience(),
            target_word_count: 800,
            additional_instructions: String::new(),
        }
    }

    #[test]
    fn status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::DoneWithWarnings.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunStatus::DoneWithWarnings).expect("serialize");
        assert_eq!(json, "\"DONE_WITH_WARNINGS\"");
    }

    #[test]
    fn new_run_starts_pending_and_empty() {
        let run = RunState::new(inputs());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.steps.drafts.is_empty());
        assert_eq!(run.next_draft_iteration(), 1);
        assert_eq!(run.next_fact_check_iteration(), 1);
    }

    #[test]
    fn iteration_numbers_derive_from_history() {
        let mut run = RunState::new(inputs());
        run.steps.drafts.push(DraftIteration {
            iteration: 1,
            content: "draft one".to_string(),
            word_count: 2,
            revision_instructions: None,
            created_at: Utc::now(),
        });
        run.steps.drafts.push(DraftIteration {
            iteration: 2,
            content: "draft two".to_string(),
            word_count: 2,
            revision_instructions: Some("fix the date".to_string()),
            created_at: Utc::now(),
        });
        assert_eq!(run.next_draft_iteration(), 3);
        assert_eq!(run.latest_draft().map(|d| d.iteration), Some(2));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut run = RunState::new(inputs());
        run.citations.push(Citation::source_document());
        let json = serde_json::to_string(&run).expect("serialize");
        assert!(json.contains("\"final\""));
        let back: RunState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, run.id);
        assert_eq!(back.citations[0].id, "S0");
    }
}
