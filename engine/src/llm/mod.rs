//! LLM Provider Abstraction Layer
//!
//! This module provides the interface the pipeline uses to reach a
//! text-completion service. The `LLMProvider` trait is deliberately small:
//! one role-tagged completion call returning plain text. Everything the
//! pipeline needs on top of that (plans, relevance lists, file changes) is
//! shaped by `conductor::generator` into prompts and parsed back out of
//! the returned text.

use async_trait::async_trait;
use sdk::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod openai;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Empty response")]
    EmptyResponse,
}

impl From<LLMError> for PipelineError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::AuthenticationFailed(_) | LLMError::InvalidRequest(_) => {
                PipelineError::TextGenerationRejected(err.to_string())
            }
            other => PipelineError::TextGeneration(other.to_string()),
        }
    }
}

/// Message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Which configured model a request should run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Planning and code generation
    Primary,
    /// Cheap classification calls such as relevance filtering
    Fast,
}

/// One completion call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tier: ModelTier,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// System + user prompt pair on the primary model
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            tier: ModelTier::Primary,
            max_tokens: 1024,
            temperature: 0.2,
        }
    }

    pub fn tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// LLM Provider trait that all providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "openai")
    fn name(&self) -> &str;

    /// Run one completion and return the text of the first choice.
    ///
    /// # Returns
    /// * `Ok(String)` - Non-empty completion text
    /// * `Err(LLMError)` - If the request fails or the response is empty
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Check if the provider is currently healthy and available
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Extract the body of a markdown code fence that wraps the whole text.
///
/// The opening fence (with its language tag line) must start the text and the
/// last ``` must end it, so fences nested inside the body are kept intact.
/// Returns `None` if the text is not a single fenced block.
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let rest = content.trim().strip_prefix("```")?;

    // Skip the language tag line (e.g. "json\n")
    let body_start = rest.find('\n')? + 1;
    let closing = rest.rfind("```")?;

    if closing < body_start || !rest[closing + 3..].trim().is_empty() {
        return None;
    }

    Some(&rest[body_start..closing])
}

/// Strip a fence wrapping the whole text if present, otherwise return the trimmed text.
pub fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    match extract_fenced_block(trimmed) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

/// Extract a balanced JSON value starting at position 0 of `s`.
///
/// Counts `open` / `close` depth, respecting string literals, to find the
/// matching close delimiter.
pub fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    if !s.starts_with(open) {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
