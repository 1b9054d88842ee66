//! Chat endpoint handler
//!
//! Handles POST /ai/chat: one non-streaming assistant turn.

use crate::assistant::Caller;
use crate::chat::{ChatRequest, ChatResponse};
use crate::error::{AppError, AppResult};
use crate::handlers::{AppState, invalid_json};
use crate::provider::ProviderError;
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use std::time::Duration;

pub async fn handler(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Json<ChatResponse>> {
    let Json(request) = body.map_err(invalid_json)?;

    tracing::debug!(
        request_id = caller.request_id.as_deref().unwrap_or("-"),
        org = %caller.org_id,
        actor = %caller.actor_id,
        message_chars = request.message().chars().count(),
        has_conversation = request.conversation_id().is_some(),
        "Received chat request"
    );

    let timeout_seconds = state.config().server.request_timeout_seconds;
    let response = tokio::time::timeout(
        Duration::from_secs(timeout_seconds),
        state.assistant().chat(caller, request),
    )
    .await
    .map_err(|_| AppError::Upstream(ProviderError::Timeout { timeout_seconds }))??;

    Ok(Json(response))
}
