//! Optional Postgres mirror for dashboards and offline analysis.
//!
//! The JSON run store is the source of truth; this mirror is strictly
//! secondary. [`AnalyticsMirror`] wraps an optional connection and
//! swallows every write failure after logging it, so a dead database
//! never stalls or fails a run.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::run::{RubricEvaluation, RunState, RunStatus};
use crate::stages::StageName;

use super::schema;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Direct, fallible access to the analytics database.
#[derive(Debug, Clone)]
pub struct AnalyticsStore {
    pool: PgPool,
}

impl AnalyticsStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, AnalyticsError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        schema::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_run(&self, state: &RunState) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, title, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(state.id)
        .bind(&state.inputs.title)
        .bind(state.status.as_str())
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        review_required: bool,
        error: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, review_required = $3, error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(review_required)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a step row; the returned id closes it via [`Self::step_end`].
    pub async fn step_start(
        &self,
        run_id: Uuid,
        stage: StageName,
        iteration: u32,
    ) -> Result<i64, AnalyticsError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO run_steps (run_id, stage, iteration)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(iteration as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn step_end(
        &self,
        step_id: i64,
        status: &str,
        summary: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            UPDATE run_steps
            SET status = $2, summary = $3, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(status)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_generation_call(
        &self,
        run_id: Uuid,
        stage: StageName,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        latency_ms: u64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO generation_calls
                (run_id, stage, model, prompt_tokens, completion_tokens, latency_ms, success, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(model)
        .bind(prompt_tokens as i32)
        .bind(completion_tokens as i32)
        .bind(latency_ms as i64)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_rubric(
        &self,
        run_id: Uuid,
        evaluation: &RubricEvaluation,
    ) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO run_rubrics
                (run_id, attempt, clarity, correctness, completeness, overall, passed, grader_model, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, attempt) DO UPDATE SET
                clarity = EXCLUDED.clarity,
                correctness = EXCLUDED.correctness,
                completeness = EXCLUDED.completeness,
                overall = EXCLUDED.overall,
                passed = EXCLUDED.passed,
                grader_model = EXCLUDED.grader_model,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(run_id)
        .bind(evaluation.attempt as i32)
        .bind(evaluation.scores.clarity)
        .bind(evaluation.scores.correctness)
        .bind(evaluation.scores.completeness)
        .bind(evaluation.scores.overall)
        .bind(evaluation.passed)
        .bind(&evaluation.grader_model)
        .bind(evaluation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log(&self, run_id: Uuid, message: &str) -> Result<(), AnalyticsError> {
        sqlx::query("INSERT INTO run_logs (run_id, message) VALUES ($1, $2)")
            .bind(run_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Fire-and-forget facade over an optional [`AnalyticsStore`].
///
/// Every method logs failures at `warn` and returns normally, keeping
/// the mirror invisible to pipeline control flow.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsMirror {
    store: Option<AnalyticsStore>,
}

impl AnalyticsMirror {
    pub fn new(store: Option<AnalyticsStore>) -> Self {
        Self { store }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub async fn create_run(&self, state: &RunState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.create_run(state).await {
                warn!(run_id = %state.id, error = %e, "analytics create_run failed");
            }
        }
    }

    pub async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        review_required: bool,
        error: Option<&str>,
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = store.set_status(run_id, status, review_required, error).await {
                warn!(%run_id, error = %e, "analytics set_status failed");
            }
        }
    }

    /// Returns `None` when the mirror is disabled or the insert failed.
    pub async fn step_start(&self, run_id: Uuid, stage: StageName, iteration: u32) -> Option<i64> {
        let store = self.store.as_ref()?;
        match store.step_start(run_id, stage, iteration).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%run_id, stage = %stage, error = %e, "analytics step_start failed");
                None
            }
        }
    }

    pub async fn step_end(&self, step_id: Option<i64>, status: &str, summary: Option<&str>) {
        let (Some(store), Some(step_id)) = (&self.store, step_id) else {
            return;
        };
        if let Err(e) = store.step_end(step_id, status, summary).await {
            warn!(step_id, error = %e, "analytics step_end failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_generation_call(
        &self,
        run_id: Uuid,
        stage: StageName,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        latency_ms: u64,
        success: bool,
        error: Option<&str>,
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = store
                .log_generation_call(
                    run_id,
                    stage,
                    model,
                    prompt_tokens,
                    completion_tokens,
                    latency_ms,
                    success,
                    error,
                )
                .await
            {
                warn!(%run_id, stage = %stage, error = %e, "analytics generation log failed");
            }
        }
    }

    pub async fn save_rubric(&self, run_id: Uuid, evaluation: &RubricEvaluation) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_rubric(run_id, evaluation).await {
                warn!(%run_id, error = %e, "analytics save_rubric failed");
            }
        }
    }

    pub async fn log(&self, run_id: Uuid, message: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.log(run_id, message).await {
                warn!(%run_id, error = %e, "analytics log failed");
            }
        }
    }
}
