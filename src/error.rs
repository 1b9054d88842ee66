//! Error types for aigate
//!
//! All errors implement `IntoResponse` for Axum handlers.

use crate::limits::RateLimitResult;
use crate::provider::ProviderError;
use crate::store::StoreError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Missing caller identity: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Admission control rejected the request before any LLM spend
    #[error("{}", .0.user_message())]
    RateLimited(Box<RateLimitResult>),

    /// Input screening hard-blocked the request
    ///
    /// The reason is deliberately generic and never names the matched pattern.
    #[error("Request blocked: {reason}")]
    Blocked { reason: String },

    #[error("AI provider error: {0}")]
    Upstream(#[from] ProviderError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. } => "config_error",
            Self::Validation(_) => "validation_error",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::RateLimited(result) => result
                .reason
                .map(|kind| kind.as_str())
                .unwrap_or("rate_limited"),
            Self::Blocked { .. } => "input_blocked",
            Self::Upstream(_) => "upstream_error",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Blocked { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the end user
    ///
    /// Server-side details (store errors, provider bodies) never leak.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::RateLimited(result) => result.user_message(),
            Self::Blocked { reason } => reason.clone(),
            Self::Upstream(_) => {
                "The AI service is temporarily unavailable. Please try again shortly.".to_string()
            }
            Self::Unauthenticated(_) | Self::PermissionDenied(_) | Self::NotFound(_) => {
                self.to_string()
            }
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. }
            | Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = self.status();
        let message = self.public_message();

        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let retry_after = match &self {
            Self::RateLimited(result) => result.retry_after_seconds,
            _ => None,
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": code,
        }));

        let mut response = (status, body).into_response();
        if let Some(seconds) = retry_after
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{LimitKind, RateLimitResult};
    use chrono::{TimeDelta, Utc};

    #[test]
    fn test_validation_error_creates() {
        let err = AppError::Validation("invalid input".to_string());
        assert_eq!(err.to_string(), "Invalid request: invalid input");
    }

    #[test]
    fn test_validation_error_response_status() {
        let err = AppError::Validation("test".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_permission_denied_response_status() {
        let response = AppError::PermissionDenied("admins only".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_not_found_response_status() {
        let response = AppError::NotFound("Conversation".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_rate_limited_sets_retry_after_header() {
        let now = Utc::now();
        let result = RateLimitResult::denied(
            LimitKind::DailyTokens,
            10_000,
            10_000,
            Some(now + TimeDelta::seconds(90)),
            now,
        );
        let err = AppError::RateLimited(Box::new(result));
        assert_eq!(err.code(), "daily_token_limit");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "90");
    }

    #[test]
    fn test_blocked_message_is_passed_through() {
        let err = AppError::Blocked {
            reason: "Your message could not be processed.".into(),
        };
        assert_eq!(err.code(), "input_blocked");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_internal_error_response_status() {
        let err = AppError::Internal("test".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_store_error_maps_to_internal() {
        let err: AppError = StoreError::Unavailable("db down".into()).into();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
