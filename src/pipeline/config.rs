//! Pipeline configuration.
//!
//! One explicit value threaded into the orchestrator constructor, never
//! ambient globals. Built via `Default`, environment variables, or the
//! builder methods, then checked once with `validate()`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::run::RubricThresholds;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Preferred model route, tried first for every stage.
    pub default_model: String,
    /// Routes tried in order after the default is exhausted.
    pub fallback_models: Vec<String>,
    /// Per-call timeout handed to the HTTP client.
    pub request_timeout: Duration,
    /// Additional fact-check attempts after the first (2 means 3 total).
    pub max_fact_check_retries: u32,
    /// Additional rubric evaluations after the first (1 means 2 total).
    pub rubric_max_retries: u32,
    /// Minimum acceptable rubric scores.
    pub rubric_thresholds: RubricThresholds,
    /// Base directory of the JSON run store.
    pub runs_dir: PathBuf,
    /// Postgres URL for the analytics mirror; `None` disables it.
    pub database_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: "groq/llama-3.3-70b-versatile".to_string(),
            fallback_models: vec![
                "groq/llama-3.1-8b-instant".to_string(),
                "openrouter/meta-llama/llama-3.3-70b-instruct".to_string(),
            ],
            request_timeout: Duration::from_secs(120),
            max_fact_check_retries: 2,
            rubric_max_retries: 1,
            rubric_thresholds: RubricThresholds::default(),
            runs_dir: PathBuf::from("runs"),
            database_url: None,
        }
    }
}

impl PipelineConfig {
    /// Overlay environment variables on the defaults.
    ///
    /// Recognized: `DRAFTFORGE_DEFAULT_MODEL`, `DRAFTFORGE_FALLBACK_MODELS`
    /// (comma separated), `DRAFTFORGE_RUNS_DIR`, `DATABASE_URL`,
    /// `DRAFTFORGE_FACT_CHECK_RETRIES`, `DRAFTFORGE_RUBRIC_RETRIES`,
    /// `LLM_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = env::var("DRAFTFORGE_DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Ok(models) = env::var("DRAFTFORGE_FALLBACK_MODELS") {
            config.fallback_models = models
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(dir) = env::var("DRAFTFORGE_RUNS_DIR") {
            config.runs_dir = PathBuf::from(dir);
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }
        if let Some(retries) = read_env_u32("DRAFTFORGE_FACT_CHECK_RETRIES") {
            config.max_fact_check_retries = retries;
        }
        if let Some(retries) = read_env_u32("DRAFTFORGE_RUBRIC_RETRIES") {
            config.rubric_max_retries = retries;
        }
        if let Some(secs) = read_env_u32("LLM_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs as u64);
        }

        config
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = dir.into();
        self
    }

    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn with_thresholds(mut self, thresholds: RubricThresholds) -> Self {
        self.rubric_thresholds = thresholds;
        self
    }

    /// The full fallback chain, default route first.
    pub fn model_routes(&self) -> Vec<String> {
        let mut routes = Vec::with_capacity(1 + self.fallback_models.len());
        routes.push(self.default_model.clone());
        for model in &self.fallback_models {
            if !routes.contains(model) {
                routes.push(model.clone());
            }
        }
        routes
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid("default_model is empty".to_string()));
        }
        if self.request_timeout.as_secs() == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout must be at least 1 second".to_string(),
            ));
        }
        let t = &self.rubric_thresholds;
        for (name, value) in [
            ("clarity", t.clarity),
            ("correctness", t.correctness),
            ("completeness", t.completeness),
            ("overall", t.overall),
        ] {
            if !(1.0..=5.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "rubric threshold '{name}' must be within 1.0..=5.0, got {value}"
                )));
            }
        }
        if self.runs_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("runs_dir is empty".to_string()));
        }
        Ok(())
    }
}

fn read_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PipelineConfig::default();
        config.validate().expect("defaults valid");
        assert_eq!(config.max_fact_check_retries, 2);
        assert_eq!(config.rubric_max_retries, 1);
        assert_eq!(config.rubric_thresholds.correctness, 4.0);
    }

    #[test]
    fn routes_start_with_default_and_dedupe() {
        let config = PipelineConfig::default()
            .with_default_model("m1")
            .with_fallback_models(vec!["m2".to_string(), "m1".to_string(), "m3".to_string()]);
        assert_eq!(config.model_routes(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn out_of_scale_threshold_rejected() {
        let config = PipelineConfig::default().with_thresholds(RubricThresholds {
            clarity: 3.0,
            correctness: 6.0,
            completeness: 3.0,
            overall: 3.5,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_model_rejected() {
        let config = PipelineConfig::default().with_default_model("  ");
        assert!(config.validate().is_err());
    }
}
