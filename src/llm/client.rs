//! HTTP client for OpenAI-compatible chat completion APIs.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

/// Default per-call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender ("system", "user", "assistant").
    pub role: String,
    /// Message content.
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A generation request bound for one model route.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Model route identifier (e.g. "groq/llama-3.1-8b-instant").
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token budget.
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Create a request with default sampling parameters.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token accounting for one generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The flattened result of one generation call.
///
/// The pipeline only ever consumes the first choice, so the response is
/// collapsed to its text plus accounting metadata.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Model that actually served the request.
    pub model: String,
    /// Generated text.
    pub text: String,
    /// Token usage reported by the backend.
    pub usage: Usage,
}

/// Trait over generation backends. Implemented by [`HttpLlmClient`] in
/// production and by scripted mocks in tests.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one generation call against the given model route.
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (LiteLLM proxy, OpenRouter, Groq, ...).
pub struct HttpLlmClient {
    api_base: String,
    api_key: Option<String>,
    http_client: Client,
    timeout: Duration,
}

impl HttpLlmClient {
    /// Create a client with an explicit endpoint and timeout.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        Ok(Self {
            api_base: api_base.into(),
            api_key,
            http_client,
            timeout,
        })
    }

    /// Create a client from environment variables.
    ///
    /// Reads `LLM_API_BASE` (required), `LLM_API_KEY` (optional) and
    /// `LLM_TIMEOUT_SECS` (optional, default 120).
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("LLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LLM_API_KEY").ok();
        let timeout_secs = env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self::new(api_base, api_key, Duration::from_secs(timeout_secs))
    }

    /// The configured API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError> {
        let api_request = ApiRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_base);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request.json(&api_request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;

        let status = http_response.status();

        if !status.is_success() {
            let code = status.as_u16();
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            if code == 429 {
                return Err(LlmError::RateLimited(message));
            }
            return Err(LlmError::ApiError { code, message });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Generation {
            model: api_response.model,
            text,
            usage: api_response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("be strict");
        assert_eq!(sys.role, "system");
        assert_eq!(sys.content, "be strict");

        let user = Message::user("hello");
        assert_eq!(user.role, "user");
    }

    #[test]
    fn request_builder() {
        let req = GenerationRequest::new("groq/llama-3.1-8b-instant", vec![Message::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(1024);

        assert_eq!(req.model, "groq/llama-3.1-8b-instant");
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.max_tokens, Some(1024));
    }

    #[test]
    fn api_request_serialization_skips_unset_fields() {
        let messages = vec![Message::user("hi")];
        let api_request = ApiRequest {
            model: "m",
            messages: &messages,
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_string(&api_request).expect("serialize");
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
    }
}
