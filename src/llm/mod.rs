//! LLM client abstraction, streaming support and phase parsing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod openrouter;
pub mod phases;
pub mod prompts;
pub mod streaming;

pub use openrouter::OpenRouterClient;
pub use phases::{Phase, PhaseEvent, PhaseParser};
pub use prompts::{PromptContext, PromptTemplate, PromptTemplates};
pub use streaming::{stream_from_text, LlmStream, SseParser, StreamChunk, StreamCollector};

/// Error types for LLM operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded: {retry_after:?}")]
    RateLimit { retry_after: Option<u64> },

    #[error("Invalid model: {model}")]
    InvalidModel { model: String },

    #[error("Request failed: {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Invalid response format: {message}")]
    InvalidResponse { message: String },

    #[error("Stream interrupted: {message}")]
    StreamInterrupted { message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

/// Represents a message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Token usage information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Configuration for LLM generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: Some(4096),
            top_p: None,
        }
    }
}

/// Streaming chat client consumed by the orchestration core.
///
/// The core treats every `delta` as opaque text appended to its parse buffer;
/// token boundaries carry no meaning. Implementations must stop producing
/// chunks once `abort` is cancelled.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Get the client name (e.g., "openrouter")
    fn name(&self) -> &str;

    /// Start a streaming completion for an ordered message list
    async fn stream_chat(
        &self,
        messages: &[Message],
        abort: CancellationToken,
    ) -> Result<LlmStream, LlmError>;
}

/// Factory for creating model clients
pub struct LlmProviderFactory;

impl LlmProviderFactory {
    /// Create a client by provider name
    pub fn create_client(
        provider_name: &str,
        model: &str,
        settings: HashMap<String, String>,
    ) -> Result<Box<dyn ModelClient>, LlmError> {
        match provider_name.to_lowercase().as_str() {
            "openrouter" | "openai" => {
                let api_key = settings.get("api_key").ok_or_else(|| LlmError::Authentication {
                    message: format!("{} API key not provided", provider_name),
                })?;

                let base_url = settings
                    .get("base_url")
                    .cloned()
                    .unwrap_or_else(|| openrouter::default_base_url(provider_name).to_string());

                let client = openrouter::OpenRouterClient::with_config(
                    api_key.clone(),
                    model.to_string(),
                    Some(base_url),
                    None,
                )
                .with_provider_name(provider_name.to_lowercase());
                Ok(Box::new(client))
            }
            _ => Err(LlmError::Unknown {
                message: format!("Unknown provider: {}", provider_name),
            }),
        }
    }

    /// List all available provider names
    pub fn list_providers() -> Vec<&'static str> {
        vec!["openrouter", "openai"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_requires_api_key() {
        let result = LlmProviderFactory::create_client("openrouter", "m", HashMap::new());
        assert!(matches!(result, Err(LlmError::Authentication { .. })));
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let mut settings = HashMap::new();
        settings.insert("api_key".to_string(), "k".to_string());
        let result = LlmProviderFactory::create_client("nope", "m", settings);
        assert!(matches!(result, Err(LlmError::Unknown { .. })));
    }

    #[test]
    fn test_factory_builds_openai_client() {
        let mut settings = HashMap::new();
        settings.insert("api_key".to_string(), "k".to_string());
        let client = LlmProviderFactory::create_client("openai", "gpt-4o-mini", settings).unwrap();
        assert_eq!(client.name(), "openai");
    }

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
