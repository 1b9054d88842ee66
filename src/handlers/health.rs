//! Health check endpoint
//!
//! Provides a simple health check for monitoring and load balancers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::handlers::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// "operational" or "degraded"
    pub telemetry_status: &'static str,
    /// "operational" or "degraded"
    pub background_status: &'static str,
}

/// Health check handler
///
/// Always 200 while the process serves requests. Telemetry status is
/// "degraded" once any usage, audit, or conversation write has failed;
/// background status is "degraded" once the maintenance loop has died.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let metrics = state.metrics();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "OK",
            telemetry_status: status_label(metrics.telemetry_failures_count()),
            background_status: status_label(metrics.background_task_failures_count()),
        }),
    )
}

fn status_label(failures: u64) -> &'static str {
    if failures > 0 { "degraded" } else { "operational" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support;
    use crate::metrics::TelemetryOperation;

    #[tokio::test]
    async fn test_health_handler_returns_ok() {
        let state = test_support::state();
        let (status, Json(body)) = handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "OK");
        assert_eq!(body.telemetry_status, "operational");
        assert_eq!(body.background_status, "operational");
    }

    #[tokio::test]
    async fn test_health_handler_shows_degraded_when_failures_occur() {
        let state = test_support::state();
        state
            .metrics()
            .telemetry_failure(TelemetryOperation::RecordUsage);

        let (status, Json(body)) = handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.telemetry_status, "degraded");
        assert_eq!(body.background_status, "operational");

        state.metrics().background_task_failure("panic");
        let (_, Json(body)) = handler(State(state)).await;
        assert_eq!(body.background_status, "degraded");
    }
}
