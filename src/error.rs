//! Error types shared across draftforge subsystems.
//!
//! Module-local errors (store, pipeline, config) live next to their
//! modules; this file holds the errors that cross module boundaries:
//! LLM transport failures and structured-output parse failures.

use thiserror::Error;

/// Errors that can occur while talking to a generation backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Generation call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed response from generation backend: {0}")]
    MalformedResponse(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty response: backend returned no choices")]
    EmptyResponse,
}

impl LlmError {
    /// True for the rate-limit class of errors, which advance the
    /// model fallback chain instead of being retried on the same route.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
            || matches!(self, LlmError::ApiError { code: 429, .. })
    }

    /// True for transport-class errors (timeout, connection failure,
    /// malformed body) that get one same-route retry before escalating.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LlmError::RequestFailed(_)
                | LlmError::Timeout { .. }
                | LlmError::MalformedResponse(_)
                | LlmError::EmptyResponse
        ) || matches!(self, LlmError::ApiError { code, .. } if *code >= 500)
    }
}

/// Errors from structured-output extraction.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("No parseable JSON object found in output (starts with: '{preview}')")]
    NoJsonFound { preview: String },

    #[error("Output was empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_classification() {
        assert!(LlmError::RateLimited("slow down".to_string()).is_rate_limit());
        assert!(LlmError::ApiError {
            code: 429,
            message: "too many requests".to_string()
        }
        .is_rate_limit());
        assert!(!LlmError::Timeout { seconds: 60 }.is_rate_limit());
    }

    #[test]
    fn transport_classification() {
        assert!(LlmError::Timeout { seconds: 60 }.is_transport());
        assert!(LlmError::RequestFailed("connection reset".to_string()).is_transport());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transport());
        assert!(!LlmError::RateLimited("nope".to_string()).is_transport());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transport());
    }
}
