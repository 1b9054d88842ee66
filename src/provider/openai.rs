//! OpenAI-compatible `/chat/completions` client

use super::sse::{SseDecoder, SseFrame};
use super::{
    ChatMessage, Completion, CompletionRequest, CompletionStream, LlmProvider, ProviderError,
    StreamDelta, TokenUsage, ToolCall, ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest upstream error body kept in a [`ProviderError::Status`]
const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiProvider {
    /// # Errors
    /// Returns `ProviderError::NotConfigured` for an empty base URL or if the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProviderError::NotConfigured(
                "provider base_url cannot be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut request = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let timeout_seconds = self.timeout.as_secs();
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProviderError::Timeout { timeout_seconds })?
            .map_err(|e| classify_transport(e, timeout_seconds))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            tracing::warn!(
                status = status.as_u16(),
                body = %body,
                "Provider returned error status"
            );
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = WireRequest::new(request, false);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );

        let response = self.send(&body).await?;
        let timeout_seconds = self.timeout.as_secs();
        let bytes = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| ProviderError::Timeout { timeout_seconds })?
            .map_err(|e| classify_transport(e, timeout_seconds))?;

        let parsed: WireResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(Completion {
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            usage,
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let body = WireRequest::new(request, true);
        let response = self.send(&body).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            let mut chars_received = 0usize;
            let mut finished = false;

            while !finished {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|e| ProviderError::StreamInterrupted {
                    chars_received,
                    message: e.to_string(),
                })?;
                for frame in decoder.push(&chunk) {
                    let data = match frame {
                        SseFrame::Done => {
                            finished = true;
                            break;
                        }
                        SseFrame::Data(data) => data,
                    };
                    for delta in parse_chunk(&data)? {
                        if let StreamDelta::Content(text) = &delta {
                            chars_received += text.chars().count();
                        }
                        yield delta;
                    }
                }
            }

            if !finished {
                if let Some(SseFrame::Data(data)) = decoder.finish() {
                    for delta in parse_chunk(&data)? {
                        yield delta;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn classify_transport(err: reqwest::Error, timeout_seconds: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { timeout_seconds }
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn parse_chunk(data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad stream chunk: {}", e)))?;
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            deltas.push(StreamDelta::Content(content));
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(StreamDelta::Usage(usage));
    }
    Ok(deltas)
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl<'a> WireRequest<'a> {
    fn new(request: &'a CompletionRequest, stream: bool) -> Self {
        let has_tools = !request.tools.is_empty();
        Self {
            model: &request.model,
            messages: &request.messages,
            tools: has_tools.then_some(request.tools.as_slice()),
            tool_choice: has_tools.then_some("auto"),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}
