//! Request pipeline for one caller
//!
//! Every chat request runs the same chain, cheapest first:
//!
//! 1. Admission: concurrency slot, hourly requests, daily and monthly tokens
//! 2. Hard block screening on the raw text
//! 3. Sanitization (redaction and flags)
//! 4. The orchestrator turn (tool catalog filtered by role inside)
//! 5. Audit of the turn, whatever its outcome
//!
//! Rejections in steps 1 and 2 happen before any LLM spend. Steps 4 and 5 run
//! on a spawned task that outlives the caller: a request timeout or a dropped
//! stream still ends with every usage record and the audit entry written.
//! Read-only endpoints go through the separate read-only request budget
//! instead.

use crate::audit::{AuditInput, AuditLogger, AuditSummary};
use crate::budget::{BudgetStatus, BudgetTracker};
use crate::chat::{
    ChatOrchestrator, ChatRequest, ChatResponse, StreamEvent, TurnEvent, TurnFailure, TurnRequest,
    TurnResult,
};
use crate::directory::{Actor, Directory, Organization};
use crate::error::{AppError, AppResult};
use crate::ids::{ActorId, ConversationId, OrgId};
use crate::limits::{RateLimitResult, RateLimiter, UsageOverview};
use crate::metrics::{Metrics, TelemetryOperation, TurnMode, TurnOutcome};
use crate::provider::TokenUsage;
use crate::sanitizer::{InputSanitizer, SanitizationResult};
use crate::store::{AuditEntry, Conversation, StoredMessage};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Flag reason recorded for hard-blocked input
pub const BLOCKED_FLAG_REASON: &str = "blocked";

pub const MAX_FLAGGED_LIMIT: usize = 100;

/// Stream events buffered between the turn task and the HTTP response
const STREAM_BUFFER: usize = 64;

/// Who is calling, as asserted by the host application's gateway
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Caller {
    pub actor_id: ActorId,
    pub org_id: OrgId,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

pub struct Assistant {
    directory: Arc<dyn Directory>,
    limiter: Arc<RateLimiter>,
    sanitizer: Arc<InputSanitizer>,
    orchestrator: Arc<ChatOrchestrator>,
    audit: Arc<AuditLogger>,
    budget: Arc<BudgetTracker>,
    metrics: Arc<Metrics>,
    recorder: TurnRecorder,
}

/// Writes turn metrics and audit entries; cloned into turn tasks
#[derive(Clone)]
struct TurnRecorder {
    audit: Arc<AuditLogger>,
    metrics: Arc<Metrics>,
}

/// Audit facts gathered while a turn runs
struct TurnAudit {
    caller: Caller,
    org: OrgId,
    actor: ActorId,
    raw_message: String,
    sanitization: SanitizationResult,
    started: Instant,
}

impl Assistant {
    pub fn new(
        directory: Arc<dyn Directory>,
        limiter: Arc<RateLimiter>,
        sanitizer: Arc<InputSanitizer>,
        orchestrator: Arc<ChatOrchestrator>,
        audit: Arc<AuditLogger>,
        budget: Arc<BudgetTracker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let recorder = TurnRecorder {
            audit: audit.clone(),
            metrics: metrics.clone(),
        };
        Self {
            directory,
            limiter,
            sanitizer,
            orchestrator,
            audit,
            budget,
            metrics,
            recorder,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// One non-streaming turn
    pub async fn chat(&self, caller: Caller, request: ChatRequest) -> AppResult<ChatResponse> {
        let started = Instant::now();
        let (actor, org) = self.resolve(&caller).await?;

        let permit = match self.limiter.admit(&actor, &org).await {
            Ok(permit) => permit,
            Err(e) => return Err(self.rejected(e, TurnMode::Sync, started)),
        };

        let turn = self
            .screen(&caller, &actor, &org, request.message(), TurnMode::Sync, started)
            .await?;
        let turn_request = TurnRequest {
            actor,
            org,
            message: turn.sanitization.sanitized.clone(),
            conversation_id: request.conversation_id(),
        };

        let orchestrator = self.orchestrator.clone();
        let recorder = self.recorder.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let outcome = orchestrator.run_turn(turn_request).await;
            recorder
                .record_turn(turn, TurnMode::Sync, outcome.as_ref())
                .await;
            outcome
                .map(TurnResult::into_response)
                .map_err(|failure| failure.error)
        });

        task.await
            .map_err(|e| AppError::Internal(format!("chat turn task failed: {}", e)))?
    }

    /// One streaming turn
    ///
    /// Admission and block failures are returned before the stream starts so
    /// the caller gets a plain HTTP error. After that, every failure arrives
    /// as the stream's terminal `error` event. The turn itself runs on its own
    /// task, which holds the concurrency slot and keeps going when the
    /// returned stream is dropped.
    pub async fn chat_stream(
        self: Arc<Self>,
        caller: Caller,
        request: ChatRequest,
    ) -> AppResult<BoxStream<'static, StreamEvent>> {
        let started = Instant::now();
        let (actor, org) = self.resolve(&caller).await?;

        let permit = match self.limiter.admit(&actor, &org).await {
            Ok(permit) => permit,
            Err(e) => return Err(self.rejected(e, TurnMode::Stream, started)),
        };

        let turn = self
            .screen(&caller, &actor, &org, request.message(), TurnMode::Stream, started)
            .await?;

        let mut events = self.orchestrator.clone().stream_turn(TurnRequest {
            actor,
            org,
            message: turn.sanitization.sanitized.clone(),
            conversation_id: request.conversation_id(),
        });

        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let mut client = StreamClient::new(tx, turn.caller.request_id.clone());
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            let _permit = permit;
            while let Some(event) = events.next().await {
                match event {
                    TurnEvent::Chunk(content) => client.send(StreamEvent::Chunk { content }).await,
                    TurnEvent::Done(result) => {
                        recorder
                            .record_turn(turn, TurnMode::Stream, Ok(&result))
                            .await;
                        client
                            .send(StreamEvent::Done {
                                conversation_id: result.conversation_id,
                                function_calls: result.function_calls,
                            })
                            .await;
                        return;
                    }
                    TurnEvent::Failed(failure) => {
                        tracing::warn!(
                            request_id = turn.caller.request_id.as_deref().unwrap_or("-"),
                            conversation_id = ?failure.conversation_id,
                            error = %failure.error,
                            "Streaming turn failed"
                        );
                        recorder
                            .record_turn(turn, TurnMode::Stream, Err(&failure))
                            .await;
                        client
                            .send(StreamEvent::Error {
                                error: failure.error.public_message(),
                                code: failure.error.code().to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };
        Ok(stream.boxed())
    }

    /// Rate-limit windows for the caller
    pub async fn usage(&self, caller: &Caller) -> AppResult<UsageOverview> {
        let (actor, org) = self.resolve_read_only(caller).await?;
        self.limiter.usage_overview(&actor, &org).await
    }

    pub async fn budget_status(&self, caller: &Caller) -> AppResult<BudgetStatus> {
        let (_, org) = self.resolve_read_only(caller).await?;
        self.budget.budget_status(&org).await
    }

    /// Admin only
    pub async fn reset_budget_alerts(&self, caller: &Caller) -> AppResult<u64> {
        let (actor, org) = self.resolve(caller).await?;
        require_elevated(&actor)?;
        tracing::info!(org = %org.id, actor = %actor.id, "Budget alerts reset requested");
        self.budget.reset_monthly_alerts(&org.id).await
    }

    /// Admin only; entries created in `[start, end)`
    pub async fn audit_summary(
        &self,
        caller: &Caller,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<AuditSummary> {
        if start >= end {
            return Err(AppError::Validation(
                "start must be earlier than end".to_string(),
            ));
        }
        let (actor, org) = self.resolve_read_only(caller).await?;
        require_elevated(&actor)?;
        Ok(self.audit.audit_summary(&org.id, start, end).await?)
    }

    /// Admin only; newest first, at most [`MAX_FLAGGED_LIMIT`]
    pub async fn flagged_queries(&self, caller: &Caller, limit: usize) -> AppResult<Vec<AuditEntry>> {
        let (actor, org) = self.resolve_read_only(caller).await?;
        require_elevated(&actor)?;
        let limit = limit.clamp(1, MAX_FLAGGED_LIMIT);
        Ok(self.audit.flagged_queries(&org.id, limit).await?)
    }

    pub async fn conversations(&self, caller: &Caller) -> AppResult<Vec<Conversation>> {
        let (actor, org) = self.resolve_read_only(caller).await?;
        self.orchestrator.list_conversations(&actor.id, &org.id).await
    }

    pub async fn conversation_messages(
        &self,
        caller: &Caller,
        id: ConversationId,
    ) -> AppResult<Vec<StoredMessage>> {
        let (actor, org) = self.resolve_read_only(caller).await?;
        self.orchestrator
            .conversation_messages(&actor.id, &org.id, id)
            .await
    }

    pub async fn delete_conversation(&self, caller: &Caller, id: ConversationId) -> AppResult<()> {
        let (actor, org) = self.resolve(caller).await?;
        self.orchestrator
            .delete_conversation(&actor.id, &org.id, id)
            .await
    }

    /// The caller's actor and organization, which must agree
    async fn resolve(&self, caller: &Caller) -> AppResult<(Actor, Organization)> {
        let actor = self
            .directory
            .actor(&caller.actor_id)
            .await?
            .filter(|a| a.org == caller.org_id)
            .ok_or_else(|| {
                AppError::Unauthenticated("unknown actor for this organization".to_string())
            })?;
        let org = self
            .directory
            .organization(&caller.org_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Organization".to_string()))?;
        Ok((actor, org))
    }

    async fn resolve_read_only(&self, caller: &Caller) -> AppResult<(Actor, Organization)> {
        let (actor, org) = self.resolve(caller).await?;
        let check = self.limiter.check_read_only(&actor.id);
        self.reject_unless_allowed(check)?;
        Ok((actor, org))
    }

    fn reject_unless_allowed(&self, check: RateLimitResult) -> AppResult<()> {
        if check.allowed {
            return Ok(());
        }
        if let Some(kind) = check.reason {
            self.metrics.rate_limited(kind);
        }
        Err(AppError::RateLimited(Box::new(check)))
    }

    fn rejected(&self, error: AppError, mode: TurnMode, started: Instant) -> AppError {
        if let AppError::RateLimited(result) = &error
            && let Some(kind) = result.reason
        {
            self.metrics.rate_limited(kind);
            self.metrics
                .turn(TurnOutcome::RateLimited, mode, started.elapsed().as_secs_f64());
        }
        error
    }

    /// Block check, then sanitization
    ///
    /// A blocked message is audited as flagged and never reaches the model.
    async fn screen(
        &self,
        caller: &Caller,
        actor: &Actor,
        org: &Organization,
        raw_message: &str,
        mode: TurnMode,
        started: Instant,
    ) -> AppResult<TurnAudit> {
        let block = self.sanitizer.should_block_input(raw_message);
        let sanitization = self.sanitizer.sanitize(raw_message);
        self.metrics.sanitizer_flags(&sanitization.flags);

        let turn = TurnAudit {
            caller: caller.clone(),
            org: org.id.clone(),
            actor: actor.id.clone(),
            raw_message: raw_message.to_string(),
            sanitization,
            started,
        };

        if block.blocked {
            let reason = block
                .reason
                .unwrap_or_else(|| "Your message could not be processed.".to_string());
            tracing::warn!(
                request_id = caller.request_id.as_deref().unwrap_or("-"),
                org = %org.id,
                actor = %actor.id,
                "Chat input blocked"
            );
            self.recorder
                .write_audit(
                    turn,
                    None,
                    None,
                    TokenUsage::default(),
                    vec![BLOCKED_FLAG_REASON.to_string()],
                )
                .await;
            self.metrics
                .turn(TurnOutcome::Blocked, mode, started.elapsed().as_secs_f64());
            return Err(AppError::Blocked { reason });
        }

        if turn.sanitization.flagged {
            tracing::info!(
                request_id = caller.request_id.as_deref().unwrap_or("-"),
                org = %org.id,
                flags = ?turn.sanitization.flag_strings(),
                "Chat input flagged by sanitizer"
            );
        }
        Ok(turn)
    }
}

impl TurnRecorder {
    async fn record_turn(
        &self,
        turn: TurnAudit,
        mode: TurnMode,
        outcome: Result<&TurnResult, &TurnFailure>,
    ) {
        let (turn_outcome, conversation_id, usage) = match outcome {
            Ok(result) => (TurnOutcome::Responded, Some(result.conversation_id), result.usage),
            Err(failure) => {
                let turn_outcome = match failure.error {
                    AppError::Upstream(_) => TurnOutcome::UpstreamError,
                    _ => TurnOutcome::Failed,
                };
                (turn_outcome, failure.conversation_id, failure.usage)
            }
        };
        self.metrics
            .turn(turn_outcome, mode, turn.started.elapsed().as_secs_f64());

        if let Err(failure) = outcome {
            tracing::warn!(
                request_id = turn.caller.request_id.as_deref().unwrap_or("-"),
                org = %turn.org,
                code = failure.error.code(),
                tokens_spent = failure.usage.total_tokens,
                "Chat turn failed"
            );
        }
        self.write_audit(turn, conversation_id, outcome.ok(), usage, Vec::new())
            .await;
    }

    /// Audit writes never fail the request
    async fn write_audit(
        &self,
        turn: TurnAudit,
        conversation_id: Option<ConversationId>,
        result: Option<&TurnResult>,
        usage: TokenUsage,
        extra_flag_reasons: Vec<String>,
    ) {
        let input = AuditInput {
            org: turn.org,
            actor: turn.actor,
            conversation_id,
            query: turn.raw_message,
            functions_called: result.map(TurnResult::functions_called).unwrap_or_default(),
            function_results: result.map(TurnResult::function_results).unwrap_or_default(),
            tokens_used: usage.total_tokens,
            response_time_ms: turn.started.elapsed().as_millis() as u64,
            ip: turn.caller.ip,
            user_agent: turn.caller.user_agent,
            sanitization: Some(turn.sanitization),
            extra_flag_reasons,
        };
        if let Err(e) = self.audit.log_audit_entry(input).await {
            tracing::error!(
                request_id = turn.caller.request_id.as_deref().unwrap_or("-"),
                error = %e,
                "Failed to write audit entry (request continues)"
            );
            self.metrics
                .telemetry_failure(TelemetryOperation::WriteAudit);
        }
    }
}

/// Sending half of a streaming response
///
/// Once the client is gone every further event is discarded; the turn task
/// keeps running to completion.
struct StreamClient {
    tx: mpsc::Sender<StreamEvent>,
    request_id: Option<String>,
    gone: bool,
}

impl StreamClient {
    fn new(tx: mpsc::Sender<StreamEvent>, request_id: Option<String>) -> Self {
        Self {
            tx,
            request_id,
            gone: false,
        }
    }

    async fn send(&mut self, event: StreamEvent) {
        if self.gone {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.gone = true;
            tracing::info!(
                request_id = self.request_id.as_deref().unwrap_or("-"),
                "Stream client disconnected; finishing the turn without it"
            );
        }
    }
}

fn require_elevated(actor: &Actor) -> AppResult<()> {
    if actor.role.is_elevated() {
        Ok(())
    } else {
        Err(AppError::PermissionDenied(
            "this action requires an owner or admin role".to_string(),
        ))
    }
}
