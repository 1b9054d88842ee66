//! Usage and budget endpoints
//!
//! - GET /ai/usage: the caller's rate-limit windows
//! - GET /ai/budget: the organization's monthly token budget
//! - POST /ai/budget/alerts/reset: re-arm this month's threshold alerts (admins)

use crate::assistant::Caller;
use crate::budget::BudgetStatus;
use crate::error::AppResult;
use crate::handlers::AppState;
use crate::limits::UsageOverview;
use axum::{Json, extract::State};
use serde::Serialize;

pub async fn usage(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<UsageOverview>> {
    Ok(Json(state.assistant().usage(&caller).await?))
}

pub async fn budget(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<BudgetStatus>> {
    Ok(Json(state.assistant().budget_status(&caller).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetAlertsResponse {
    pub markers_cleared: u64,
}

pub async fn reset_alerts(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<ResetAlertsResponse>> {
    let markers_cleared = state.assistant().reset_budget_alerts(&caller).await?;
    Ok(Json(ResetAlertsResponse { markers_cleared }))
}
