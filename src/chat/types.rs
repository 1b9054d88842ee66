//! Request and response types for assistant turns

use crate::ids::ConversationId;
use crate::store::FunctionCallTrace;
use serde::{Deserialize, Deserializer, Serialize};

/// Hard ceiling on inbound message size, in characters
///
/// Anything between the sanitizer's max input length and this value is
/// accepted and truncated (and flagged) rather than rejected.
pub const MAX_MESSAGE_LENGTH: usize = 32_000;

/// Chat request from client
///
/// Validation is enforced during deserialization - invalid instances cannot exist.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    message: String,
    conversation_id: Option<ConversationId>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, conversation_id: Option<ConversationId>) -> Self {
        Self {
            message: message.into(),
            conversation_id,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }
}

impl<'de> Deserialize<'de> for ChatRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawChatRequest {
            message: String,
            #[serde(default, alias = "conversation_id")]
            conversation_id: Option<ConversationId>,
        }

        let raw = RawChatRequest::deserialize(deserializer)?;

        if raw.message.trim().is_empty() {
            return Err(serde::de::Error::custom(
                "message cannot be empty or contain only whitespace",
            ));
        }

        // Count Unicode characters, not bytes
        let char_count = raw.message.chars().count();
        if char_count > MAX_MESSAGE_LENGTH {
            return Err(serde::de::Error::custom(format!(
                "message exceeds maximum length of {} characters (got {})",
                MAX_MESSAGE_LENGTH, char_count
            )));
        }

        Ok(ChatRequest {
            message: raw.message,
            conversation_id: raw.conversation_id,
        })
    }
}

/// Answer to one non-streaming turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: ConversationId,
    pub function_calls: Vec<FunctionCallTrace>,
}

/// One server-sent event of a streaming turn
///
/// A stream carries any number of `chunk` events followed by exactly one
/// `done` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        conversation_id: ConversationId,
        function_calls: Vec<FunctionCallTrace>,
    },
    Error {
        error: String,
        code: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}
