//! Conversation endpoints
//!
//! Callers only ever see their own, unexpired conversations. Anything else
//! answers 404 so one actor cannot discover another actor's conversation ids.

use crate::assistant::Caller;
use crate::error::AppResult;
use crate::handlers::{AppState, parse_conversation_id};
use crate::store::{Conversation, StoredMessage};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<Vec<Conversation>>> {
    Ok(Json(state.assistant().conversations(&caller).await?))
}

pub async fn messages(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<StoredMessage>>> {
    let id = parse_conversation_id(&id)?;
    Ok(Json(
        state
            .assistant()
            .conversation_messages(&caller, id)
            .await?,
    ))
}

pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = parse_conversation_id(&id)?;
    state.assistant().delete_conversation(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
