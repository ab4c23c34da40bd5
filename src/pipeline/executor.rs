//! Stage execution over a model fallback chain.
//!
//! One executor serves every stage: it renders the persona prompt and
//! walks the configured routes. A rate-limited route is abandoned
//! immediately for the next one; a transport failure (timeout,
//! connection error, malformed body) gets exactly one retry on the same
//! route before the chain advances. Only when every route is exhausted
//! does the stage fail hard.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmProvider, Message, Usage};
use crate::stages::{StageName, StagePersona};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("All model routes exhausted for stage '{stage}': {last_error}")]
    RoutesExhausted {
        stage: StageName,
        #[source]
        last_error: LlmError,
        /// Every generation call that was made before giving up.
        attempts: Vec<AttemptRecord>,
    },
}

/// Accounting for one generation call, successful or not. Failed
/// calls carry zero token counts but still record the route and the
/// time spent waiting on it.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Result of one successful stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub text: String,
    /// Model that served the request (may differ from the route name
    /// when the backend resolves aliases).
    pub model: String,
    pub usage: Usage,
    pub latency_ms: u64,
    /// Every generation call made, failures included, in order. The
    /// last entry is the successful one.
    pub attempts: Vec<AttemptRecord>,
}

/// Runs persona prompts against the provider, falling back across
/// model routes.
pub struct StageExecutor {
    provider: Arc<dyn LlmProvider>,
    routes: Vec<String>,
}

impl StageExecutor {
    pub fn new(provider: Arc<dyn LlmProvider>, routes: Vec<String>) -> Self {
        Self { provider, routes }
    }

    /// Render the persona prompt with `vars` and execute it.
    pub async fn run(
        &self,
        stage: StageName,
        persona: &StagePersona,
        vars: &[(&str, &str)],
    ) -> Result<StageOutcome, ExecutorError> {
        let messages = vec![
            Message::system(persona.system_prompt()),
            Message::user(persona.render(vars)),
        ];

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error = LlmError::EmptyResponse;

        for route in &self.routes {
            // One retry on the same route for transport-class failures.
            for retry in 0..2u32 {
                let request = GenerationRequest::new(route.clone(), messages.clone())
                    .with_temperature(persona.temperature);

                let started = Instant::now();
                match self.provider.generate(request).await {
                    Ok(generation) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        debug!(
                            stage = %stage,
                            route,
                            attempt = attempts.len() + 1,
                            latency_ms,
                            "stage generation succeeded"
                        );
                        attempts.push(AttemptRecord {
                            model: generation.model.clone(),
                            prompt_tokens: generation.usage.prompt_tokens,
                            completion_tokens: generation.usage.completion_tokens,
                            latency_ms,
                            success: true,
                            error: None,
                        });
                        return Ok(StageOutcome {
                            text: generation.text,
                            model: generation.model,
                            usage: generation.usage,
                            latency_ms,
                            attempts,
                        });
                    }
                    Err(e) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        attempts.push(AttemptRecord {
                            model: route.clone(),
                            prompt_tokens: 0,
                            completion_tokens: 0,
                            latency_ms,
                            success: false,
                            error: Some(e.to_string()),
                        });
                        if e.is_rate_limit() {
                            warn!(stage = %stage, route, error = %e, "route rate limited, advancing chain");
                            last_error = e;
                            break;
                        } else if e.is_transport() && retry == 0 {
                            warn!(stage = %stage, route, error = %e, "transport failure, retrying route once");
                            last_error = e;
                        } else {
                            warn!(stage = %stage, route, error = %e, "route failed, advancing chain");
                            last_error = e;
                            break;
                        }
                    }
                }
            }
        }

        Err(ExecutorError::RoutesExhausted {
            stage,
            last_error,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Generation;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted provider: pops one queued result per generate call and
    /// records which route each call used.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError> {
            self.calls.lock().unwrap().push(request.model.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(LlmError::EmptyResponse));
            next.map(|text| Generation {
                model: request.model,
                text,
                usage: Usage::default(),
            })
        }
    }

    fn persona() -> StagePersona {
        StagePersona {
            role: "Writer".to_string(),
            goal: "write".to_string(),
            temperature: 0.3,
            prompt_template: "Write about {topic}.".to_string(),
        }
    }

    fn executor(provider: ScriptedProvider, routes: &[&str]) -> (Arc<ScriptedProvider>, StageExecutor) {
        let provider = Arc::new(provider);
        let exec = StageExecutor::new(
            provider.clone(),
            routes.iter().map(|r| r.to_string()).collect(),
        );
        (provider, exec)
    }

    #[tokio::test]
    async fn first_route_success() {
        let (provider, exec) =
            executor(ScriptedProvider::new(vec![Ok("draft".to_string())]), &["m1", "m2"]);
        let outcome = exec
            .run(StageName::Write, &persona(), &[("topic", "caching")])
            .await
            .expect("success");
        assert_eq!(outcome.text, "draft");
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].success);
        assert_eq!(provider.calls(), vec!["m1"]);
    }

    #[tokio::test]
    async fn rate_limit_advances_without_retry() {
        let (provider, exec) = executor(
            ScriptedProvider::new(vec![
                Err(LlmError::RateLimited("slow down".to_string())),
                Ok("draft".to_string()),
            ]),
            &["m1", "m2"],
        );
        let outcome = exec
            .run(StageName::Write, &persona(), &[])
            .await
            .expect("fallback success");
        assert_eq!(provider.calls(), vec!["m1", "m2"]);

        // The rate-limited call is accounted for, not just the success.
        assert_eq!(outcome.attempts.len(), 2);
        let failed = &outcome.attempts[0];
        assert_eq!(failed.model, "m1");
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap().contains("slow down"));
        assert_eq!(failed.prompt_tokens, 0);
        assert!(outcome.attempts[1].success);
        assert_eq!(outcome.attempts[1].model, "m2");
    }

    #[tokio::test]
    async fn transport_failure_retries_same_route_once() {
        let (provider, exec) = executor(
            ScriptedProvider::new(vec![
                Err(LlmError::Timeout { seconds: 5 }),
                Ok("draft".to_string()),
            ]),
            &["m1", "m2"],
        );
        let outcome = exec
            .run(StageName::Write, &persona(), &[])
            .await
            .expect("retry success");
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
        assert_eq!(provider.calls(), vec!["m1", "m1"]);
    }

    #[tokio::test]
    async fn second_transport_failure_advances_chain() {
        let (provider, exec) = executor(
            ScriptedProvider::new(vec![
                Err(LlmError::Timeout { seconds: 5 }),
                Err(LlmError::RequestFailed("reset".to_string())),
                Ok("draft".to_string()),
            ]),
            &["m1", "m2"],
        );
        let outcome = exec
            .run(StageName::Write, &persona(), &[])
            .await
            .expect("chain success");
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(provider.calls(), vec!["m1", "m1", "m2"]);
    }

    #[tokio::test]
    async fn exhausted_chain_is_hard_failure() {
        let (provider, exec) = executor(
            ScriptedProvider::new(vec![
                Err(LlmError::RateLimited("a".to_string())),
                Err(LlmError::RateLimited("b".to_string())),
            ]),
            &["m1", "m2"],
        );
        let err = exec
            .run(StageName::Research, &persona(), &[])
            .await
            .expect_err("exhausted");
        let ExecutorError::RoutesExhausted {
            stage, attempts, ..
        } = err;
        assert_eq!(stage, StageName::Research);
        assert_eq!(provider.calls(), vec!["m1", "m2"]);

        // Both failed calls left a record behind.
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| !a.success && a.error.is_some()));
        assert_eq!(attempts[0].model, "m1");
        assert_eq!(attempts[1].model, "m2");
    }
}
