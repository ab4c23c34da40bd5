//! The run state machine.
//!
//! Stage order: research, write, fact_check (bounded loop), polish,
//! rubric (bounded loop with rollback to write). Stages within a run
//! are strictly sequential and every transition is persisted to the
//! run store before the next stage starts, so a crash resumes from the
//! last completed stage's output. The analytics mirror is written
//! fire-and-forget and never influences control flow.
//!
//! Hard stage failures (model routes exhausted, unparseable research,
//! blank generation) put the run into `ERROR` with a message and halt;
//! they are not `Err` values. Only store failures propagate as errors,
//! because a run whose state cannot be persisted has no trustworthy
//! state at all.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::LlmProvider;
use crate::parse::parse_structured;
use crate::quality::{
    build_fact_check_revision, build_rubric_revision, normalize_fact_check, QualityGate,
};
use crate::run::{
    citations, Citation, DraftIteration, FactCheckIteration, FeedbackRecord, FinalArtifact,
    QualityGateSummary, ResearchFindings, RubricEvaluation, RunState, RunStatus,
};
use crate::stages::{PersonaBook, StageName};
use crate::store::{AnalyticsMirror, RunStore, StoreError};

use super::config::PipelineConfig;
use super::executor::{AttemptRecord, ExecutorError, StageExecutor, StageOutcome};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `Some(value)` continues the pipeline; `None` means the run was
/// already moved to `ERROR` and the caller should stop.
type Flow<T> = Result<Option<T>, PipelineError>;

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    executor: StageExecutor,
    personas: PersonaBook,
    gate: QualityGate,
    store: RunStore,
    analytics: AnalyticsMirror,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn LlmProvider>,
        personas: PersonaBook,
        store: RunStore,
        analytics: AnalyticsMirror,
    ) -> Self {
        let executor = StageExecutor::new(provider, config.model_routes());
        let gate = QualityGate::new(config.rubric_thresholds);
        Self {
            config,
            executor,
            personas,
            gate,
            store,
            analytics,
        }
    }

    /// Run the full pipeline from the beginning.
    pub async fn execute(&self, run_id: Uuid) -> Result<RunState, PipelineError> {
        let mut state = self.store.load(run_id).await?;
        self.begin(&mut state, "run started").await?;

        if self.run_research(&mut state, None).await?.is_none() {
            return Ok(state);
        }
        let Some(fact_passed) = self.write_fact_check_loop(&mut state, None).await? else {
            return Ok(state);
        };
        self.finalize(&mut state, fact_passed, None, true).await?;
        Ok(state)
    }

    /// Re-enter a terminal run at `stage`, reusing everything upstream
    /// of it verbatim.
    pub async fn execute_from_stage(
        &self,
        run_id: Uuid,
        stage: StageName,
        feedback: &str,
    ) -> Result<RunState, PipelineError> {
        let mut state = self.store.load(run_id).await?;

        state.feedback.push(FeedbackRecord {
            stage,
            text: feedback.to_string(),
            submitted_at: Utc::now(),
        });
        // Anything downstream of the re-entry point is superseded.
        state.steps.final_output = None;
        state.steps.rubric = None;
        state.quality_gate = None;
        self.begin(&mut state, &format!("feedback re-entry at {stage}"))
            .await?;

        match stage {
            StageName::Research => {
                if self.run_research(&mut state, Some(feedback)).await?.is_none() {
                    return Ok(state);
                }
                let Some(fact_passed) = self.write_fact_check_loop(&mut state, None).await? else {
                    return Ok(state);
                };
                self.finalize(&mut state, fact_passed, None, true).await?;
            }
            StageName::Write => {
                let instructions = format!("Reader feedback to incorporate: {feedback}");
                let Some(fact_passed) = self
                    .write_fact_check_loop(&mut state, Some(instructions))
                    .await?
                else {
                    return Ok(state);
                };
                self.finalize(&mut state, fact_passed, None, true).await?;
            }
            StageName::FactCheck => {
                // Re-verify the latest draft; an unreadable verdict is
                // treated as approval because the caller explicitly
                // asked to move forward.
                let Some(check) = self.run_fact_check(&mut state, Some(feedback), true).await?
                else {
                    return Ok(state);
                };
                let fact_passed = if check.passed {
                    true
                } else {
                    let instructions = check
                        .rewrite_instructions
                        .clone()
                        .unwrap_or_else(|| build_fact_check_revision(&check.issues));
                    let Some(passed) = self
                        .write_fact_check_loop(&mut state, Some(instructions))
                        .await?
                    else {
                        return Ok(state);
                    };
                    passed
                };
                self.finalize(&mut state, fact_passed, None, true).await?;
            }
            StageName::Polish => {
                // Polish feedback never produces new drafts or verdicts.
                let fact_passed = state
                    .steps
                    .fact_checks
                    .last()
                    .map(|c| c.passed)
                    .unwrap_or(true);
                self.finalize(&mut state, fact_passed, Some(feedback), false)
                    .await?;
            }
            StageName::Rubric => {
                // Unreachable through the service, which rejects rubric
                // feedback before it gets here.
                self.fail_run(&mut state, "rubric is not a feedback entry point".to_string())
                    .await?;
            }
        }
        Ok(state)
    }

    async fn begin(&self, state: &mut RunState, note: &str) -> Result<(), PipelineError> {
        state.status = RunStatus::Running;
        state.error = None;
        self.store.save(state).await?;
        self.store.append_log(state.id, note).await?;
        self.analytics.create_run(state).await;
        self.analytics
            .set_status(state.id, RunStatus::Running, false, None)
            .await;
        self.analytics.log(state.id, note).await;
        Ok(())
    }

    // ---- research ------------------------------------------------------

    async fn run_research(&self, state: &mut RunState, feedback: Option<&str>) -> Flow<()> {
        let instructions = match feedback {
            Some(feedback) => format!(
                "{}\nReader feedback to incorporate: {}",
                state.inputs.additional_instructions, feedback
            ),
            None => state.inputs.additional_instructions.clone(),
        };
        let vars = [
            ("title", state.inputs.title.as_str()),
            ("source_text", state.inputs.source_text.as_str()),
            ("additional_instructions", instructions.as_str()),
        ];

        let outcome = match self.call_stage(state, StageName::Research, 1, &vars).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_run(state, e.to_string()).await?;
                return Ok(None);
            }
        };

        // Research is the one stage whose output must parse: everything
        // downstream cites it.
        let payload = match parse_structured(&outcome.text) {
            Ok(payload) => payload,
            Err(e) => {
                self.fail_run(state, format!("research output unusable: {e}"))
                    .await?;
                return Ok(None);
            }
        };

        let findings = match extract_findings(&payload) {
            Some(findings) => findings,
            None => {
                // Parsed but structurally invalid: fall back to findings
                // synthesized from the source document instead of failing.
                warn!(run_id = %state.id, "research payload invalid, synthesizing from source");
                self.store
                    .append_log(state.id, "research payload invalid, synthesized fallback used")
                    .await?;
                synthesize_findings(&state.inputs.source_text)
            }
        };

        state.citations = citations::ensure_source_document(findings.sources.clone());
        state.steps.research = Some(ResearchFindings {
            sources: state.citations.clone(),
            ..findings
        });
        self.store.save(state).await?;
        self.store
            .append_log(
                state.id,
                &format!("research done with {} sources", state.citations.len()),
            )
            .await?;
        info!(run_id = %state.id, sources = state.citations.len(), "research complete");
        Ok(Some(()))
    }

    // ---- write / fact-check loop ----------------------------------------

    /// Draft-then-verify until the verdict passes or the retry budget
    /// runs out. Returns whether the surviving draft passed.
    async fn write_fact_check_loop(
        &self,
        state: &mut RunState,
        initial_instructions: Option<String>,
    ) -> Flow<bool> {
        let mut instructions = initial_instructions;
        let total_attempts = self.config.max_fact_check_retries + 1;

        for _ in 0..total_attempts {
            if self.run_write(state, instructions.take()).await?.is_none() {
                return Ok(None);
            }
            let Some(check) = self.run_fact_check(state, None, false).await? else {
                return Ok(None);
            };
            if check.passed {
                return Ok(Some(true));
            }
            instructions = Some(
                check
                    .rewrite_instructions
                    .clone()
                    .unwrap_or_else(|| build_fact_check_revision(&check.issues)),
            );
        }

        // Budget exhausted: proceed with the latest draft, flagged.
        self.store
            .append_log(state.id, "fact-check retries exhausted, continuing with warnings")
            .await?;
        warn!(run_id = %state.id, "fact-check retries exhausted");
        Ok(Some(false))
    }

    async fn run_write(&self, state: &mut RunState, instructions: Option<String>) -> Flow<()> {
        let research_json = research_json(state);
        let word_count = state.inputs.target_word_count.to_string();
        let revision = instructions.clone().unwrap_or_default();
        let vars = [
            ("title", state.inputs.title.as_str()),
            ("tone", state.inputs.tone.as_str()),
            ("audience", state.inputs.audience.as_str()),
            ("word_count", word_count.as_str()),
            ("research_json", research_json.as_str()),
            ("revision_instructions", revision.as_str()),
            (
                "additional_instructions",
                state.inputs.additional_instructions.as_str(),
            ),
        ];

        let iteration = state.next_draft_iteration();
        let outcome = match self.call_stage(state, StageName::Write, iteration, &vars).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_run(state, e.to_string()).await?;
                return Ok(None);
            }
        };
        let content = outcome.text.trim().to_string();
        if content.is_empty() {
            self.fail_run(state, "writer produced an empty draft".to_string())
                .await?;
            return Ok(None);
        }

        state.steps.drafts.push(DraftIteration {
            iteration,
            word_count: word_count_of(&content),
            content,
            revision_instructions: instructions,
            created_at: Utc::now(),
        });
        self.store.save(state).await?;
        self.store
            .append_log(state.id, &format!("draft {iteration} written"))
            .await?;
        Ok(Some(()))
    }

    async fn run_fact_check(
        &self,
        state: &mut RunState,
        feedback: Option<&str>,
        default_passed: bool,
    ) -> Flow<FactCheckIteration> {
        let Some(draft) = state.latest_draft().map(|d| d.content.clone()) else {
            self.fail_run(state, "fact-check requested before any draft exists".to_string())
                .await?;
            return Ok(None);
        };
        let research_json = research_json(state);
        let feedback_text = feedback
            .map(|f| format!("Reader feedback to weigh: {f}"))
            .unwrap_or_default();
        let vars = [
            ("research_json", research_json.as_str()),
            ("draft", draft.as_str()),
            ("feedback", feedback_text.as_str()),
        ];

        let iteration = state.next_fact_check_iteration();
        let payload = match self
            .call_stage(state, StageName::FactCheck, iteration, &vars)
            .await
        {
            Ok(outcome) => parse_structured(&outcome.text).ok(),
            Err(e) => {
                self.fail_run(state, e.to_string()).await?;
                return Ok(None);
            }
        };

        // An unparseable verdict degrades to a recorded failure (or a
        // pass on feedback paths); it never aborts the run.
        let check = normalize_fact_check(payload.as_ref(), iteration, default_passed);
        state.steps.fact_checks.push(check.clone());
        self.store.save(state).await?;
        self.store
            .append_log(
                state.id,
                &format!(
                    "fact-check {iteration} {}",
                    if check.passed { "passed" } else { "failed" }
                ),
            )
            .await?;
        Ok(Some(check))
    }

    // ---- polish / rubric gate --------------------------------------------

    /// Polish the surviving draft and hold it against the rubric gate,
    /// rolling back to the write loop (when permitted) while the retry
    /// budget lasts. Always leaves the run in a terminal state unless a
    /// hard failure already did.
    async fn finalize(
        &self,
        state: &mut RunState,
        mut fact_passed: bool,
        polish_feedback: Option<&str>,
        allow_rollback: bool,
    ) -> Result<(), PipelineError> {
        let mut polish_feedback = polish_feedback.map(str::to_string);
        let mut evaluations_this_call = 0u32;

        loop {
            if self
                .run_polish(state, polish_feedback.take().as_deref())
                .await?
                .is_none()
            {
                return Ok(());
            }

            let evaluation = self.grade_rubric(state).await?;
            evaluations_this_call += 1;
            self.analytics.save_rubric(state.id, &evaluation).await;
            state.rubric_attempt_count = evaluation.attempt;
            state.steps.rubric = Some(evaluation.clone());
            self.store.save(state).await?;
            self.store
                .append_log(
                    state.id,
                    &format!(
                        "rubric attempt {} {} (overall {:.2})",
                        evaluation.attempt,
                        if evaluation.passed { "passed" } else { "failed" },
                        evaluation.scores.overall
                    ),
                )
                .await?;

            if evaluation.passed {
                return self
                    .complete(state, fact_passed, &evaluation, false)
                    .await;
            }

            if evaluations_this_call > self.config.rubric_max_retries {
                // Budget exhausted: ship the best attempt, flagged for
                // human review.
                return self.complete(state, fact_passed, &evaluation, true).await;
            }

            let instructions = build_rubric_revision(&evaluation, None);
            if allow_rollback {
                let Some(passed) = self
                    .write_fact_check_loop(state, Some(instructions))
                    .await?
                else {
                    return Ok(());
                };
                fact_passed = passed;
            } else {
                // Polish-only re-entry: revise in place, no new drafts.
                polish_feedback = Some(instructions);
            }
        }
    }

    async fn run_polish(&self, state: &mut RunState, feedback: Option<&str>) -> Flow<()> {
        let Some(draft) = state.latest_draft().map(|d| d.content.clone()) else {
            self.fail_run(state, "polish requested before any draft exists".to_string())
                .await?;
            return Ok(None);
        };
        let feedback_text = feedback
            .map(|f| format!("Reader feedback to incorporate: {f}"))
            .unwrap_or_default();
        let vars = [
            ("tone", state.inputs.tone.as_str()),
            ("audience", state.inputs.audience.as_str()),
            ("draft", draft.as_str()),
            ("feedback", feedback_text.as_str()),
            (
                "additional_instructions",
                state.inputs.additional_instructions.as_str(),
            ),
        ];

        let outcome = match self.call_stage(state, StageName::Polish, 1, &vars).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_run(state, e.to_string()).await?;
                return Ok(None);
            }
        };
        let markdown = outcome.text.trim().to_string();
        if markdown.is_empty() {
            self.fail_run(state, "polish produced an empty artifact".to_string())
                .await?;
            return Ok(None);
        }

        let draft_markers = citations::marker_count(&draft);
        let final_markers = citations::marker_count(&markdown);
        if final_markers < draft_markers {
            warn!(
                run_id = %state.id,
                draft_markers,
                final_markers,
                "polish reduced citation marker count"
            );
            self.store
                .append_log(
                    state.id,
                    &format!(
                        "polish reduced citation markers from {draft_markers} to {final_markers}"
                    ),
                )
                .await?;
        }

        state.steps.final_output = Some(FinalArtifact {
            word_count: word_count_of(&markdown),
            citation_markers: final_markers,
            markdown,
            created_at: Utc::now(),
        });
        self.store.save(state).await?;
        self.store.append_log(state.id, "polish done").await?;
        Ok(Some(()))
    }

    /// Grade the final artifact. Grader problems of any kind degrade to
    /// a failing evaluation; this stage never hard-fails the run.
    async fn grade_rubric(&self, state: &RunState) -> Result<RubricEvaluation, PipelineError> {
        let attempt = state.rubric_attempt_count + 1;
        let final_markdown = state
            .steps
            .final_output
            .as_ref()
            .map(|f| f.markdown.clone())
            .unwrap_or_default();
        let vars = [
            ("final_markdown", final_markdown.as_str()),
            ("source_text", state.inputs.source_text.as_str()),
        ];

        let evaluation = match self.call_stage(state, StageName::Rubric, attempt, &vars).await {
            Ok(outcome) => {
                let payload = parse_structured(&outcome.text).ok();
                self.gate
                    .normalize_rubric(payload.as_ref(), &outcome.model, attempt)
            }
            Err(e) => {
                warn!(run_id = %state.id, error = %e, "grader unavailable, recording failing evaluation");
                self.gate.normalize_rubric(None, "unavailable", attempt)
            }
        };
        Ok(evaluation)
    }

    async fn complete(
        &self,
        state: &mut RunState,
        fact_passed: bool,
        evaluation: &RubricEvaluation,
        review_required: bool,
    ) -> Result<(), PipelineError> {
        let status = if fact_passed && evaluation.passed && !review_required {
            RunStatus::Done
        } else {
            RunStatus::DoneWithWarnings
        };

        state.quality_gate = Some(QualityGateSummary {
            fact_check_passed: fact_passed,
            fact_check_attempts: state.steps.fact_checks.len() as u32,
            rubric_passed: evaluation.passed,
            rubric_attempts: evaluation.attempt,
            review_required,
        });
        state.status = status;
        self.store.save(state).await?;
        self.store
            .append_log(state.id, &format!("run finished: {}", status.as_str()))
            .await?;
        self.analytics
            .set_status(state.id, status, review_required, None)
            .await;
        info!(run_id = %state.id, status = status.as_str(), review_required, "run finished");
        Ok(())
    }

    // ---- shared plumbing -------------------------------------------------

    async fn call_stage(
        &self,
        state: &RunState,
        stage: StageName,
        iteration: u32,
        vars: &[(&str, &str)],
    ) -> Result<StageOutcome, ExecutorError> {
        let step_id = self.analytics.step_start(state.id, stage, iteration).await;
        let persona = self.personas.get(stage);
        let result = self.executor.run(stage, persona, vars).await;

        // Every generation call gets its own metrics row, the failed
        // intermediate attempts included.
        let attempts: &[AttemptRecord] = match &result {
            Ok(outcome) => &outcome.attempts,
            Err(ExecutorError::RoutesExhausted { attempts, .. }) => attempts,
        };
        for attempt in attempts {
            self.analytics
                .log_generation_call(
                    state.id,
                    stage,
                    &attempt.model,
                    attempt.prompt_tokens,
                    attempt.completion_tokens,
                    attempt.latency_ms,
                    attempt.success,
                    attempt.error.as_deref(),
                )
                .await;
        }

        match &result {
            Ok(_) => self.analytics.step_end(step_id, "DONE", None).await,
            Err(e) => {
                let message = e.to_string();
                self.analytics.step_end(step_id, "ERROR", Some(&message)).await;
            }
        }
        result
    }

    async fn fail_run(&self, state: &mut RunState, message: String) -> Result<(), PipelineError> {
        warn!(run_id = %state.id, error = %message, "run failed");
        state.status = RunStatus::Error;
        state.error = Some(message.clone());
        self.store.save(state).await?;
        self.store.append_log(state.id, &message).await?;
        self.analytics
            .set_status(state.id, RunStatus::Error, false, Some(&message))
            .await;
        Ok(())
    }
}

fn research_json(state: &RunState) -> String {
    state
        .steps
        .research
        .as_ref()
        .and_then(|r| serde_json::to_string(r).ok())
        .unwrap_or_else(|| "{}".to_string())
}

fn word_count_of(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Pull typed findings out of the parsed research payload. `None` when
/// the payload lacks a usable sources list.
fn extract_findings(payload: &Value) -> Option<ResearchFindings> {
    let sources = payload.get("sources")?.as_array()?;
    let sources: Vec<Citation> = sources
        .iter()
        .filter_map(|s| serde_json::from_value(s.clone()).ok())
        .filter(|c: &Citation| !c.id.trim().is_empty())
        .collect();
    if sources.is_empty() {
        return None;
    }

    Some(ResearchFindings {
        summary: payload
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        key_points: payload
            .get("key_points")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        sources,
        synthesized: false,
    })
}

/// Minimal findings built from the source document alone, used when
/// the research output parsed but had no usable sources.
fn synthesize_findings(source_text: &str) -> ResearchFindings {
    let summary: String = source_text.chars().take(600).collect();
    ResearchFindings {
        summary,
        key_points: Vec::new(),
        sources: vec![Citation::source_document()],
        synthesized: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_findings_requires_sources() {
        assert!(extract_findings(&json!({"summary": "s"})).is_none());
        assert!(extract_findings(&json!({"sources": []})).is_none());

        let findings = extract_findings(&json!({
            "summary": "s",
            "key_points": ["a", "b"],
            "sources": [{"id": "S1", "title": "t"}]
        }))
        .expect("findings");
        assert_eq!(findings.sources.len(), 1);
        assert_eq!(findings.key_points, vec!["a", "b"]);
        assert!(!findings.synthesized);
    }

    #[test]
    fn synthesized_findings_cite_the_source_document() {
        let findings = synthesize_findings("The product launches in Q3.");
        assert!(findings.synthesized);
        assert_eq!(findings.sources[0].id, "S0");
        assert!(findings.summary.starts_with("The product"));
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(word_count_of("one  two\nthree"), 3);
        assert_eq!(word_count_of("   "), 0);
    }
}
