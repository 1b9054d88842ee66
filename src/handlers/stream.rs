//! Streaming chat endpoint handler
//!
//! Handles POST /ai/chat/stream. Returns a Server-Sent Events stream of
//! [`StreamEvent`]s, one JSON object per `data:` line:
//!
//! ```text
//! data: {"type":"chunk","content":"Three people"}
//!
//! data: {"type":"done","conversationId":"...","functionCalls":[...]}
//!
//! ```
//!
//! Rate-limit and block rejections happen before the stream opens and come
//! back as ordinary JSON errors. Closing the connection drops the stream,
//! which aborts the provider call and frees the concurrency slot.

use crate::assistant::Caller;
use crate::chat::{ChatRequest, StreamEvent};
use crate::error::AppResult;
use crate::handlers::{AppState, invalid_json};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

pub async fn handler(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Json(request) = body.map_err(invalid_json)?;

    tracing::debug!(
        request_id = caller.request_id.as_deref().unwrap_or("-"),
        org = %caller.org_id,
        actor = %caller.actor_id,
        "Received streaming chat request"
    );

    let events = state.assistant().clone().chat_stream(caller, request).await?;
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize stream event");
        Event::default().data(r#"{"type":"error","error":"Internal server error","code":"internal_error"}"#)
    })
}
