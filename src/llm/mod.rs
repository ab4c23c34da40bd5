//! Generation client for OpenAI-compatible chat completion backends.
//!
//! One HTTP client serves every model route; the route (model name)
//! travels in the request, so the stage executor can walk a fallback
//! chain without rebuilding clients.

mod client;

pub use client::{Generation, GenerationRequest, HttpLlmClient, LlmProvider, Message, Usage};
