//! The exposed run API.
//!
//! [`RunService`] wraps the orchestrator with the per-run single-writer
//! guard: at most one `execute` or `feedback` call may drive a given
//! run at a time, and a second caller gets [`ServiceError::RunBusy`]
//! instead of interleaved stage writes. Reads are never blocked.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmProvider;
use crate::pipeline::{ConfigError, PipelineConfig, PipelineError, PipelineOrchestrator};
use crate::run::{RunInputs, RunState, RunStatus};
use crate::stages::{PersonaBook, PersonaError, StageName};
use crate::store::{AnalyticsMirror, RunStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("Run {0} is already being executed")]
    RunBusy(Uuid),

    #[error("Run {0} is still in progress; feedback requires a finished run")]
    NotTerminal(Uuid),

    #[error("Stage '{0}' does not accept feedback")]
    StageNotEligible(StageName),

    #[error("Invalid run inputs: {0}")]
    InvalidInputs(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Library entry point for creating and driving runs.
pub struct RunService {
    store: RunStore,
    orchestrator: PipelineOrchestrator,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunService {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn LlmProvider>,
        analytics: AnalyticsMirror,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let personas = PersonaBook::embedded()?;
        let store = RunStore::new(config.runs_dir.clone());
        let orchestrator =
            PipelineOrchestrator::new(config, provider, personas, store.clone(), analytics);
        Ok(Self {
            store,
            orchestrator,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Create a `PENDING` run and persist it. Nothing executes yet.
    pub async fn create_run(&self, inputs: RunInputs) -> Result<RunState, ServiceError> {
        if inputs.source_text.trim().is_empty() {
            return Err(ServiceError::InvalidInputs("source_text is empty".to_string()));
        }
        if inputs.title.trim().is_empty() {
            return Err(ServiceError::InvalidInputs("title is empty".to_string()));
        }

        let state = RunState::new(inputs);
        self.store.init_run(&state).await?;
        Ok(state)
    }

    /// Execute a run's pipeline. Idempotent: a run that has already
    /// left `PENDING` is returned as-is instead of being re-executed.
    pub async fn execute(&self, run_id: Uuid) -> Result<RunState, ServiceError> {
        let _guard = self.claim(run_id)?;

        let state = self.load(run_id).await?;
        if state.status != RunStatus::Pending {
            return Ok(state);
        }
        Ok(self.orchestrator.execute(run_id).await?)
    }

    /// Re-enter a finished run at `stage` with feedback text.
    pub async fn feedback(
        &self,
        run_id: Uuid,
        stage: StageName,
        text: &str,
    ) -> Result<RunState, ServiceError> {
        if !stage.accepts_feedback() {
            return Err(ServiceError::StageNotEligible(stage));
        }

        let _guard = self.claim(run_id)?;

        let state = self.load(run_id).await?;
        if !state.status.is_terminal() {
            return Err(ServiceError::NotTerminal(run_id));
        }
        Ok(self
            .orchestrator
            .execute_from_stage(run_id, stage, text)
            .await?)
    }

    /// Read-only snapshot of a run.
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunState, ServiceError> {
        self.load(run_id).await
    }

    async fn load(&self, run_id: Uuid) -> Result<RunState, ServiceError> {
        match self.store.load(run_id).await {
            Ok(state) => Ok(state),
            Err(StoreError::NotFound(id)) => Err(ServiceError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn claim(&self, run_id: Uuid) -> Result<ActiveGuard, ServiceError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !active.insert(run_id) {
            return Err(ServiceError::RunBusy(run_id));
        }
        Ok(ActiveGuard {
            runs: self.active.clone(),
            run_id,
        })
    }
}

/// Releases the run's writer slot when the driving call returns, on
/// every path including errors.
struct ActiveGuard {
    runs: Arc<Mutex<HashSet<Uuid>>>,
    run_id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self
            .runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        active.remove(&self.run_id);
    }
}
