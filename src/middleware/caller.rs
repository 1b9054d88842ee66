//! Caller identity extraction
//!
//! The host application's authenticated gateway asserts who is calling via
//! `x-actor-id` and `x-org-id`. Both are required on every `/ai` route.

use crate::assistant::Caller;
use crate::error::AppError;
use crate::ids::{ActorId, OrgId};
use crate::middleware::RequestId;
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header::USER_AGENT, request::Parts},
};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ORG_ID_HEADER: &str = "x-org-id";

const MAX_USER_AGENT_LEN: usize = 512;

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let actor_id = required_header(headers, ACTOR_ID_HEADER)?;
        let org_id = required_header(headers, ORG_ID_HEADER)?;

        Ok(Caller {
            actor_id: ActorId::new(actor_id),
            org_id: OrgId::new(org_id),
            ip: client_ip(headers),
            user_agent: header_str(headers, USER_AGENT.as_str())
                .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect()),
            request_id: parts
                .extensions
                .get::<RequestId>()
                .map(|id| id.as_str().to_string()),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    header_str(headers, name)
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthenticated(format!("missing {} header", name)))
}

/// First hop of `x-forwarded-for`, else `x-real-ip`
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
}
