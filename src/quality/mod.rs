//! Quality gate: normalization of grader and verifier payloads.
//!
//! Model output is treated as untrusted. Scores are clamped to the 1.0
//! to 5.0 scale, a missing overall score is derived from the other
//! dimensions, and unparseable verdicts degrade to explicit failures
//! instead of aborting the run.

use chrono::Utc;
use serde_json::Value;

use crate::run::{FactCheckIteration, Issue, RubricEvaluation, RubricScores, RubricThresholds};

/// Score scale bounds.
pub const SCORE_MIN: f64 = 1.0;
pub const SCORE_MAX: f64 = 5.0;

/// Clamp a raw score into the rubric scale.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return SCORE_MIN;
    }
    score.clamp(SCORE_MIN, SCORE_MAX)
}

/// Threshold checks applied to every rubric evaluation.
#[derive(Debug, Clone)]
pub struct QualityGate {
    pub thresholds: RubricThresholds,
}

impl QualityGate {
    pub fn new(thresholds: RubricThresholds) -> Self {
        Self { thresholds }
    }

    /// Turn a raw grader payload into an evaluation.
    ///
    /// `payload = None` (grader failure or unparseable output) yields a
    /// minimum-score failing evaluation with the problem recorded as a
    /// weakness, so the rubric loop always has something to act on.
    pub fn normalize_rubric(
        &self,
        payload: Option<&Value>,
        grader_model: &str,
        attempt: u32,
    ) -> RubricEvaluation {
        let Some(payload) = payload else {
            return self.failing_evaluation(
                "Grader produced no usable evaluation; treat all dimensions as failing.",
                grader_model,
                attempt,
            );
        };

        let raw_scores = payload.get("scores").unwrap_or(payload);
        let clarity = clamp_score(read_score(raw_scores, "clarity"));
        let correctness = clamp_score(read_score(raw_scores, "correctness"));
        let completeness = clamp_score(read_score(raw_scores, "completeness"));
        let overall = match raw_scores.get("overall").and_then(Value::as_f64) {
            Some(v) => clamp_score(v),
            None => rounded_mean(&[clarity, correctness, completeness]),
        };

        let scores = RubricScores {
            clarity,
            correctness,
            completeness,
            overall,
        };

        RubricEvaluation {
            scores,
            thresholds: self.thresholds,
            passed: self.passes(&scores),
            strengths: read_string_list(payload, "strengths"),
            weaknesses: read_string_list(payload, "weaknesses"),
            recommendations: read_string_list(payload, "recommendations"),
            attempt,
            grader_model: grader_model.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Conjunction of all four per-dimension checks.
    pub fn passes(&self, scores: &RubricScores) -> bool {
        scores.clarity >= self.thresholds.clarity
            && scores.correctness >= self.thresholds.correctness
            && scores.completeness >= self.thresholds.completeness
            && scores.overall >= self.thresholds.overall
    }

    fn failing_evaluation(
        &self,
        weakness: &str,
        grader_model: &str,
        attempt: u32,
    ) -> RubricEvaluation {
        RubricEvaluation {
            scores: RubricScores {
                clarity: SCORE_MIN,
                correctness: SCORE_MIN,
                completeness: SCORE_MIN,
                overall: SCORE_MIN,
            },
            thresholds: self.thresholds,
            passed: false,
            strengths: Vec::new(),
            weaknesses: vec![weakness.to_string()],
            recommendations: Vec::new(),
            attempt,
            grader_model: grader_model.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Turn a raw verifier payload into a fact-check record.
///
/// `payload = None` records one synthetic issue and takes the verdict
/// from `default_passed`: false inside the normal loop (an unreadable
/// verdict must not count as approval), true on feedback re-entry where
/// the user explicitly asked to move forward.
pub fn normalize_fact_check(
    payload: Option<&Value>,
    iteration: u32,
    default_passed: bool,
) -> FactCheckIteration {
    let Some(payload) = payload else {
        return FactCheckIteration {
            iteration,
            passed: default_passed,
            issues: vec![Issue {
                claim: "(verifier output)".to_string(),
                reason: "Verifier returned no parseable verdict.".to_string(),
                suggested_fix: "Regenerate the draft with clearer sourced claims.".to_string(),
                source_ids: Vec::new(),
            }],
            rewrite_instructions: None,
            created_at: Utc::now(),
        };
    };

    let passed = payload
        .get("passed")
        .and_then(Value::as_bool)
        .unwrap_or(default_passed);

    let issues: Vec<Issue> = payload
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let rewrite_instructions = if passed || issues.is_empty() {
        None
    } else {
        Some(build_fact_check_revision(&issues))
    };

    FactCheckIteration {
        iteration,
        passed,
        issues,
        rewrite_instructions,
        created_at: Utc::now(),
    }
}

/// Rewrite guidance handed to the next draft after a failed fact check.
pub fn build_fact_check_revision(issues: &[Issue]) -> String {
    let mut lines =
        vec!["Revise the draft to resolve these factual problems:".to_string()];
    for issue in issues {
        let mut line = format!("- Claim: {} | Problem: {}", issue.claim, issue.reason);
        if !issue.suggested_fix.is_empty() {
            line.push_str(&format!(" | Fix: {}", issue.suggested_fix));
        }
        if !issue.source_ids.is_empty() {
            line.push_str(&format!(" | Sources: {}", issue.source_ids.join(", ")));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Rewrite guidance handed to the next draft after a failed rubric
/// evaluation. Weaknesses are carried verbatim.
pub fn build_rubric_revision(evaluation: &RubricEvaluation, feedback: Option<&str>) -> String {
    let mut lines = vec![format!(
        "The previous version scored below the quality bar (clarity {:.1}, correctness {:.1}, completeness {:.1}, overall {:.1}). Rewrite it to fix these weaknesses:",
        evaluation.scores.clarity,
        evaluation.scores.correctness,
        evaluation.scores.completeness,
        evaluation.scores.overall,
    )];
    for weakness in &evaluation.weaknesses {
        lines.push(format!("- {weakness}"));
    }
    for recommendation in &evaluation.recommendations {
        lines.push(format!("- Recommendation: {recommendation}"));
    }
    if let Some(feedback) = feedback {
        if !feedback.trim().is_empty() {
            lines.push(format!("Reader feedback to incorporate: {feedback}"));
        }
    }
    lines.join("\n")
}

fn read_score(scores: &Value, key: &str) -> f64 {
    scores.get(key).and_then(Value::as_f64).unwrap_or(SCORE_MIN)
}

fn read_string_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn rounded_mean(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (mean * 100.0).round() / 100.0
}
