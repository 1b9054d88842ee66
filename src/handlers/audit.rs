//! Audit endpoints (admins only)
//!
//! - GET /ai/audit/summary?start=<rfc3339>&end=<rfc3339>
//! - GET /ai/audit/flagged?limit=<n>

use crate::assistant::Caller;
use crate::audit::AuditSummary;
use crate::error::AppResult;
use crate::handlers::{AppState, invalid_query};
use crate::store::AuditEntry;
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Window used when the caller omits `start`
pub const DEFAULT_SUMMARY_DAYS: i64 = 30;
pub const DEFAULT_FLAGGED_LIMIT: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct SummaryParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl SummaryParams {
    /// `end` defaults to now, `start` to [`DEFAULT_SUMMARY_DAYS`] before `end`
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.end.unwrap_or(now);
        let start = self
            .start
            .unwrap_or_else(|| end - Duration::days(DEFAULT_SUMMARY_DAYS));
        (start, end)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FlaggedParams {
    pub limit: Option<usize>,
}

pub async fn summary(
    State(state): State<AppState>,
    caller: Caller,
    params: Result<Query<SummaryParams>, QueryRejection>,
) -> AppResult<Json<AuditSummary>> {
    let Query(params) = params.map_err(invalid_query)?;
    let (start, end) = params.window(Utc::now());
    Ok(Json(
        state.assistant().audit_summary(&caller, start, end).await?,
    ))
}

pub async fn flagged(
    State(state): State<AppState>,
    caller: Caller,
    params: Result<Query<FlaggedParams>, QueryRejection>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    let Query(params) = params.map_err(invalid_query)?;
    let limit = params.limit.unwrap_or(DEFAULT_FLAGGED_LIMIT);
    Ok(Json(state.assistant().flagged_queries(&caller, limit).await?))
}
