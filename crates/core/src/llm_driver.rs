// LLM Driver Abstractions
//
// Provider-agnostic request/response types and the LlmDriver trait.
// Drivers perform exactly one HTTP call per invocation; retries, timeouts and
// cost accounting live in the ModelAdapter (provider.rs).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub arguments: serde_json::Value,
}

/// Message format for LLM calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One chat-completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Token counts reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Normalized provider response
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    /// None when the provider omitted usage fields
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

// ============================================================================
// DriverError
// ============================================================================

/// Raw failure of a single provider call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// Auth failure, malformed request, unknown model
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl DriverError {
    /// Transient failures are retried by the adapter
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout
                | DriverError::RateLimited { .. }
                | DriverError::Server { .. }
                | DriverError::Transport(_)
        )
    }

    /// Classify an HTTP status code from a provider
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => DriverError::Timeout,
            429 => DriverError::RateLimited { retry_after: None },
            500..=599 => DriverError::Server { status, message },
            _ => DriverError::Rejected { status, message },
        }
    }
}

// ============================================================================
// LlmDriver Trait
// ============================================================================

/// Trait for LLM drivers
///
/// Implementations handle provider-specific API calls and response parsing.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &str;

    /// Perform one chat completion call
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, DriverError>;
}

#[async_trait]
impl<T: LlmDriver + ?Sized> LlmDriver for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, DriverError> {
        (**self).chat_completion(request).await
    }
}
