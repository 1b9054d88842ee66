//! LLM provider seam
//!
//! The orchestrator talks to one chat-completions provider through
//! [`LlmProvider`]. [`OpenAiProvider`] speaks the OpenAI-compatible wire
//! format; [`RetryingProvider`] wraps any provider with bounded retries on
//! transient failures.

mod openai;
mod pricing;
mod retry;
mod sse;

pub use openai::OpenAiProvider;
pub use pricing::{ModelPrice, PricingTable};
pub use retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS, MAX_BACKOFF_MS, RetryPolicy, RetryingProvider};
pub use sse::{SseDecoder, SseFrame};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One message in the provider transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// A function offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: function_type(),
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Provider-agnostic request
///
/// `tool_choice=auto` is sent whenever `tools` is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A complete, non-streamed answer
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub model: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Incremental output of a streamed answer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Content(String),
    Usage(TokenUsage),
}

/// Dropping the stream drops the underlying HTTP body, which aborts the call
pub type CompletionStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider timed out after {timeout_seconds}s")]
    Timeout { timeout_seconds: u64 },

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider stream interrupted after {chars_received} characters: {message}")]
    StreamInterrupted {
        chars_received: usize,
        message: String,
    },

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Worth retrying: timeouts, connection failures, 429, and 5xx
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::InvalidResponse(_)
            | ProviderError::StreamInterrupted { .. }
            | ProviderError::NotConfigured(_) => false,
        }
    }

    /// Short label for metrics and logs
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Status { .. } => "status",
            ProviderError::Transport(_) => "transport",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::StreamInterrupted { .. } => "stream_interrupted",
            ProviderError::NotConfigured(_) => "not_configured",
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_serialize_with_role_tag() {
        let value = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hi"}));

        let value = serde_json::to_value(ChatMessage::Tool {
            tool_call_id: "call_1".into(),
            content: "{}".into(),
        })
        .unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
    }

    #[test]
    fn test_assistant_tool_call_message_round_trips() {
        let raw = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "search_assets", "arguments": "{\"query\":\"laptop\"}"}
            }]
        });
        let message: ChatMessage = serde_json::from_value(raw).unwrap();
        match &message {
            ChatMessage::Assistant { content, tool_calls } => {
                assert!(content.is_none());
                assert_eq!(tool_calls[0].function.name, "search_assets");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout { timeout_seconds: 5 }.is_transient());
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(
            ProviderError::Status {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            ProviderError::Status {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Status {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ProviderError::InvalidResponse("bad json".into()).is_transient());
    }

    #[test]
    fn test_token_usage_totals() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }
}
