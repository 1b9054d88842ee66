//! Conversation and tool-use state machine
//!
//! One turn moves through
//! `NEW -> AWAITING_MODEL -> [TOOL_CALLS_REQUESTED -> EXECUTING_TOOLS -> AWAITING_MODEL] -> RESPONDED`
//! and ends either responded or on an upstream error. The tool round runs at
//! most once: the follow-up call is made without tools.
//!
//! The orchestrator assumes its input was already admitted by the rate
//! limiter and screened by the sanitizer; see [`crate::assistant`].

pub mod conversation;
pub mod prompt;
pub mod types;

pub use types::{ChatRequest, ChatResponse, MAX_MESSAGE_LENGTH, StreamEvent};

use crate::clock::Clock;
use crate::directory::{Actor, Organization};
use crate::error::{AppError, AppResult};
use crate::ids::{ActorId, ConversationId, OrgId};
use crate::metrics::{Metrics, TelemetryOperation, ToolOutcome};
use crate::permissions::PermissionFilter;
use crate::provider::{
    ChatMessage, Completion, CompletionRequest, LlmProvider, PricingTable, StreamDelta, ToolCall,
    TokenUsage,
};
use crate::sanitizer::KeyDenyList;
use crate::store::{
    Conversation, ConversationStore, FunctionCallTrace, MessageRole, StoredMessage, UsageRecord,
    UsageStore,
};
use crate::tools::{FunctionRegistry, ToolContext};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Shown when the model returns no text at all
const EMPTY_ANSWER: &str =
    "I couldn't generate a response. Please try rephrasing your question.";

/// Rough chars-per-token ratio used when a stream ends without usage
const CHARS_PER_TOKEN: u64 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Prior messages replayed as context
    pub history_limit: usize,
    pub title_max_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.3),
            max_tokens: Some(1024),
            history_limit: DEFAULT_HISTORY_LIMIT,
            title_max_chars: conversation::DEFAULT_TITLE_MAX_CHARS,
        }
    }
}

/// An admitted, screened turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub actor: Actor,
    pub org: Organization,
    /// Sanitized message text; this is what gets persisted and sent
    pub message: String,
    pub conversation_id: Option<ConversationId>,
}

/// What a completed turn produced
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub conversation_id: ConversationId,
    pub message: String,
    pub function_calls: Vec<FunctionCallTrace>,
    /// Summed over every provider call of the turn
    pub usage: TokenUsage,
}

impl TurnResult {
    pub fn functions_called(&self) -> Vec<String> {
        self.function_calls.iter().map(|f| f.name.clone()).collect()
    }

    pub fn function_results(&self) -> Vec<Value> {
        self.function_calls.iter().map(|f| f.result.clone()).collect()
    }

    pub fn into_response(self) -> ChatResponse {
        ChatResponse {
            message: self.message,
            conversation_id: self.conversation_id,
            function_calls: self.function_calls,
        }
    }
}

/// A turn that ended in an error, with what it had already spent
#[derive(Debug)]
pub struct TurnFailure {
    pub error: AppError,
    /// Set once the conversation was resolved or created
    pub conversation_id: Option<ConversationId>,
    /// Tokens spent before the failure
    pub usage: TokenUsage,
}

impl TurnFailure {
    fn before_conversation(error: AppError) -> Self {
        Self {
            error,
            conversation_id: None,
            usage: TokenUsage::default(),
        }
    }
}

/// Item of [`ChatOrchestrator::stream_turn`]
#[derive(Debug)]
pub enum TurnEvent {
    Chunk(String),
    Done(TurnResult),
    Failed(TurnFailure),
}

/// Context assembled before the first provider call
struct PreparedTurn {
    conversation: Conversation,
    messages: Vec<ChatMessage>,
    tool_context: ToolContext,
}

pub struct ChatOrchestrator {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<dyn FunctionRegistry>,
    permissions: Arc<PermissionFilter>,
    conversations: Arc<dyn ConversationStore>,
    usage: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    pricing: PricingTable,
    scrubber: KeyDenyList,
    settings: ChatSettings,
}

impl ChatOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<dyn FunctionRegistry>,
        permissions: Arc<PermissionFilter>,
        conversations: Arc<dyn ConversationStore>,
        usage: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            provider,
            registry,
            permissions,
            conversations,
            usage,
            clock,
            metrics,
            pricing: PricingTable::default(),
            scrubber: KeyDenyList::default(),
            settings: ChatSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_scrubber(mut self, scrubber: KeyDenyList) -> Self {
        self.scrubber = scrubber;
        self
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Run one non-streaming turn
    ///
    /// Upstream errors propagate with the usage already spent; the user
    /// message is already persisted by then.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResult, TurnFailure> {
        let prepared = self
            .prepare(&request)
            .await
            .map_err(TurnFailure::before_conversation)?;
        let conversation_id = prepared.conversation.id;
        let failed = |error: AppError, usage: TokenUsage| TurnFailure {
            error,
            conversation_id: Some(conversation_id),
            usage,
        };
        let tools = self.permissions.tools_for(request.actor.role);

        let first = self
            .provider
            .complete(&self.completion_request(prepared.messages.clone(), tools))
            .await
            .map_err(|e| failed(e.into(), TokenUsage::default()))?;
        self.record_usage(&request, &first.model, first.usage).await;
        let mut usage = first.usage;

        let (answer, traces) = if first.tool_calls.is_empty() {
            (first.content.clone(), Vec::new())
        } else {
            let (messages, traces) = self.run_tools(&prepared, &first).await;
            let second = self
                .provider
                .complete(&self.completion_request(messages, Vec::new()))
                .await
                .map_err(|e| failed(e.into(), usage))?;
            self.record_usage(&request, &second.model, second.usage).await;
            usage = add_usage(usage, second.usage);
            (second.content, traces)
        };

        let message = non_empty_answer(answer);
        self.persist_assistant(conversation_id, &message, &traces)
            .await
            .map_err(|e| failed(e, usage))?;

        Ok(TurnResult {
            conversation_id,
            message,
            function_calls: traces,
            usage,
        })
    }

    /// Run one turn, streaming the final answer
    ///
    /// Preparation, the first provider call and tool execution match
    /// [`run_turn`](Self::run_turn). The final answer is streamed as chunks
    /// and buffered for a single persistence write. The stream ends with
    /// exactly one `Done` or `Failed`. Dropping it early aborts the provider
    /// call and skips the follow-up usage record, so callers that must meter
    /// every call drive it to the end.
    pub fn stream_turn(self: Arc<Self>, request: TurnRequest) -> BoxStream<'static, TurnEvent> {
        async_stream::stream! {
            let prepared = match self.prepare(&request).await {
                Ok(prepared) => prepared,
                Err(error) => {
                    yield TurnEvent::Failed(TurnFailure::before_conversation(error));
                    return;
                }
            };
            let conversation_id = prepared.conversation.id;
            let tools = self.permissions.tools_for(request.actor.role);

            let first = match self
                .provider
                .complete(&self.completion_request(prepared.messages.clone(), tools))
                .await
            {
                Ok(first) => first,
                Err(e) => {
                    yield TurnEvent::Failed(TurnFailure {
                        error: e.into(),
                        conversation_id: Some(conversation_id),
                        usage: TokenUsage::default(),
                    });
                    return;
                }
            };
            self.record_usage(&request, &first.model, first.usage).await;
            let mut usage = first.usage;

            let mut traces = Vec::new();
            let mut answer = String::new();

            if first.tool_calls.is_empty() {
                // Nothing to stream from the provider: the first answer is final
                answer = non_empty_answer(first.content.clone());
                yield TurnEvent::Chunk(answer.clone());
            } else {
                let (messages, executed) = self.run_tools(&prepared, &first).await;
                traces = executed;

                let followup = self.completion_request(messages, Vec::new());
                let mut deltas = match self.provider.stream(&followup).await {
                    Ok(deltas) => deltas,
                    Err(e) => {
                        yield TurnEvent::Failed(TurnFailure {
                            error: e.into(),
                            conversation_id: Some(conversation_id),
                            usage,
                        });
                        return;
                    }
                };

                let mut streamed_usage = None;
                let mut failure = None;
                while let Some(delta) = deltas.next().await {
                    match delta {
                        Ok(StreamDelta::Content(text)) => {
                            answer.push_str(&text);
                            yield TurnEvent::Chunk(text);
                        }
                        Ok(StreamDelta::Usage(reported)) => streamed_usage = Some(reported),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                let second_usage = streamed_usage
                    .unwrap_or_else(|| estimate_usage(&followup.messages, &answer));
                self.record_usage(&request, &followup.model, second_usage).await;
                usage = add_usage(usage, second_usage);

                if let Some(e) = failure {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        chars_received = answer.chars().count(),
                        error = %e,
                        "Provider stream failed mid-answer"
                    );
                    yield TurnEvent::Failed(TurnFailure {
                        error: e.into(),
                        conversation_id: Some(conversation_id),
                        usage,
                    });
                    return;
                }

                if answer.is_empty() {
                    answer = EMPTY_ANSWER.to_string();
                    yield TurnEvent::Chunk(answer.clone());
                }
            }

            if let Err(error) = self.persist_assistant(conversation_id, &answer, &traces).await {
                yield TurnEvent::Failed(TurnFailure { error, conversation_id: Some(conversation_id), usage });
                return;
            }

            yield TurnEvent::Done(TurnResult {
                conversation_id,
                message: answer,
                function_calls: traces,
                usage,
            });
        }
        .boxed()
    }

    /// Conversations of the caller that have not expired
    pub async fn list_conversations(
        &self,
        actor: &ActorId,
        org: &OrgId,
    ) -> AppResult<Vec<Conversation>> {
        let now = self.clock.now();
        let conversations = self.conversations.conversations_for(actor, org).await?;
        Ok(conversations
            .into_iter()
            .filter(|c| !c.is_expired(now))
            .collect())
    }

    pub async fn conversation_messages(
        &self,
        actor: &ActorId,
        org: &OrgId,
        id: ConversationId,
    ) -> AppResult<Vec<StoredMessage>> {
        self.owned_conversation(id, actor, org).await?;
        Ok(self.conversations.messages(id).await?)
    }

    pub async fn delete_conversation(
        &self,
        actor: &ActorId,
        org: &OrgId,
        id: ConversationId,
    ) -> AppResult<()> {
        self.owned_conversation(id, actor, org).await?;
        if !self.conversations.delete_conversation(id).await? {
            return Err(AppError::NotFound("Conversation".to_string()));
        }
        tracing::info!(conversation_id = %id, actor = %actor, "Conversation deleted");
        Ok(())
    }

    /// The conversation, if it exists, is live and belongs to the caller
    ///
    /// Foreign and expired conversations are indistinguishable from missing
    /// ones.
    async fn owned_conversation(
        &self,
        id: ConversationId,
        actor: &ActorId,
        org: &OrgId,
    ) -> AppResult<Conversation> {
        match self.conversations.conversation(id).await? {
            Some(c) if &c.owner == actor && &c.org == org && !c.is_expired(self.clock.now()) => {
                Ok(c)
            }
            _ => Err(AppError::NotFound("Conversation".to_string())),
        }
    }

    /// Steps 1 to 3: conversation, user message, context
    async fn prepare(&self, request: &TurnRequest) -> AppResult<PreparedTurn> {
        let now = self.clock.now();

        let (conversation, history) = match request.conversation_id {
            Some(id) => {
                let conversation = self
                    .owned_conversation(id, &request.actor.id, &request.org.id)
                    .await?;
                let history = self
                    .conversations
                    .recent_messages(id, self.settings.history_limit)
                    .await?;
                (conversation, history)
            }
            None => {
                let conversation = Conversation {
                    id: ConversationId::new(),
                    org: request.org.id.clone(),
                    owner: request.actor.id.clone(),
                    title: conversation::derive_title(
                        &request.message,
                        self.settings.title_max_chars,
                    ),
                    created_at: now,
                    updated_at: now,
                    expires_at: conversation::expires_at(now, request.org.chat_retention_days),
                };
                self.conversations
                    .insert_conversation(conversation.clone())
                    .await?;
                tracing::debug!(
                    conversation_id = %conversation.id,
                    org = %conversation.org,
                    expires_at = ?conversation.expires_at,
                    "Conversation created"
                );
                (conversation, Vec::new())
            }
        };

        self.conversations
            .append_message(StoredMessage {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                role: MessageRole::User,
                content: request.message.clone(),
                function_calls: Vec::new(),
                created_at: now,
            })
            .await?;

        let accessible = self.permissions.accessible_functions(request.actor.role);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(prompt::system_prompt(
            &request.actor,
            &request.org,
            &accessible,
        )));
        messages.extend(history.into_iter().filter_map(|m| match m.role {
            MessageRole::User => Some(ChatMessage::user(m.content)),
            MessageRole::Assistant => Some(ChatMessage::assistant(m.content)),
            MessageRole::Tool => None,
        }));
        messages.push(ChatMessage::user(request.message.clone()));

        Ok(PreparedTurn {
            conversation,
            messages,
            tool_context: ToolContext {
                org: request.org.id.clone(),
                actor: request.actor.id.clone(),
                role: request.actor.role,
            },
        })
    }

    fn completion_request(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<crate::provider::ToolDefinition>,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.settings.model.clone(),
            messages,
            tools,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Execute every requested call and extend the transcript with the results
    async fn run_tools(
        &self,
        prepared: &PreparedTurn,
        first: &Completion,
    ) -> (Vec<ChatMessage>, Vec<FunctionCallTrace>) {
        let mut messages = prepared.messages.clone();
        messages.push(ChatMessage::Assistant {
            content: first.content.clone(),
            tool_calls: first.tool_calls.clone(),
        });

        let mut traces = Vec::with_capacity(first.tool_calls.len());
        for call in &first.tool_calls {
            let trace = self.execute_call(call, &prepared.tool_context).await;
            messages.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                content: trace.result.to_string(),
            });
            traces.push(trace);
        }
        (messages, traces)
    }

    /// Failures never escape: they become `{"error": ...}` results
    async fn execute_call(&self, call: &ToolCall, context: &ToolContext) -> FunctionCallTrace {
        let started = Instant::now();
        let name = call.function.name.clone();

        let (arguments, result, outcome) = match parse_arguments(&call.function.arguments) {
            Err(e) => {
                tracing::warn!(function = %name, error = %e, "Model produced invalid function arguments");
                (
                    Value::Object(Default::default()),
                    json!({ "error": "Invalid function arguments" }),
                    ToolOutcome::Error,
                )
            }
            Ok(arguments) => {
                if !self.permissions.can_access_function(&name, context.role) {
                    tracing::warn!(
                        function = %name,
                        actor = %context.actor,
                        role = context.role.as_str(),
                        "Model requested a function outside the caller's permissions"
                    );
                    (
                        arguments,
                        json!({ "error": "You do not have permission to use this function" }),
                        ToolOutcome::Denied,
                    )
                } else {
                    match self.registry.execute(&name, arguments.clone(), context).await {
                        Ok(mut result) => {
                            let removed = self.scrubber.scrub(&mut result);
                            if removed > 0 {
                                tracing::debug!(function = %name, removed, "Scrubbed function result keys");
                            }
                            let outcome = if is_error_result(&result) {
                                ToolOutcome::Error
                            } else {
                                ToolOutcome::Success
                            };
                            (arguments, result, outcome)
                        }
                        Err(e) => {
                            tracing::warn!(function = %name, error = %e, "Function execution failed");
                            (arguments, json!({ "error": e.to_string() }), ToolOutcome::Error)
                        }
                    }
                }
            }
        };

        self.metrics.tool_call(outcome);
        FunctionCallTrace {
            id: call.id.clone(),
            name,
            arguments,
            result,
            success: outcome == ToolOutcome::Success,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Usage writes never fail the turn
    async fn record_usage(&self, request: &TurnRequest, model: &str, usage: TokenUsage) {
        let model = if model.is_empty() {
            self.settings.model.as_str()
        } else {
            model
        };
        self.metrics
            .llm_tokens(usage.prompt_tokens, usage.completion_tokens);

        let record = UsageRecord {
            id: Uuid::new_v4(),
            org: request.org.id.clone(),
            actor: request.actor.id.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            model: model.to_string(),
            cost_usd: self.pricing.cost_usd(model, &usage),
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.usage.insert_usage(record).await {
            tracing::error!(
                org = %request.org.id,
                actor = %request.actor.id,
                total_tokens = usage.total_tokens,
                error = %e,
                "Failed to record AI usage (request continues)"
            );
            self.metrics
                .telemetry_failure(TelemetryOperation::RecordUsage);
        }
    }

    async fn persist_assistant(
        &self,
        conversation_id: ConversationId,
        content: &str,
        traces: &[FunctionCallTrace],
    ) -> AppResult<()> {
        let now = self.clock.now();
        self.conversations
            .append_message(StoredMessage {
                id: Uuid::new_v4(),
                conversation_id,
                role: MessageRole::Assistant,
                content: content.to_string(),
                function_calls: traces.to_vec(),
                created_at: now,
            })
            .await?;
        if let Err(e) = self.conversations.touch_conversation(conversation_id, now).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to touch conversation");
            self.metrics
                .telemetry_failure(TelemetryOperation::TouchConversation);
        }
        Ok(())
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

fn is_error_result(result: &Value) -> bool {
    result.as_object().is_some_and(|o| o.contains_key("error"))
}

fn non_empty_answer(content: Option<String>) -> String {
    content
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| EMPTY_ANSWER.to_string())
}

fn add_usage(a: TokenUsage, b: TokenUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: a.prompt_tokens + b.prompt_tokens,
        completion_tokens: a.completion_tokens + b.completion_tokens,
        total_tokens: a.total_tokens + b.total_tokens,
    }
}

/// Used when the provider closed the stream without reporting usage
fn estimate_usage(messages: &[ChatMessage], answer: &str) -> TokenUsage {
    let prompt_chars: usize = messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } | ChatMessage::User { content } => content.len(),
            ChatMessage::Assistant { content, .. } => content.as_deref().map_or(0, str::len),
            ChatMessage::Tool { content, .. } => content.len(),
        })
        .sum();
    TokenUsage::new(
        (prompt_chars as u64).div_ceil(CHARS_PER_TOKEN),
        (answer.chars().count() as u64).div_ceil(CHARS_PER_TOKEN),
    )
}
