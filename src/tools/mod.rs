//! Function registry seam
//!
//! The functions themselves (employee search, payroll lookups, ...) live in
//! the host application. The orchestrator only knows them by name and invokes
//! them through [`FunctionRegistry`].

mod http;

pub use http::HttpFunctionRegistry;

use crate::directory::Role;
use crate::ids::{ActorId, OrgId};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' failed: {message}")]
    Execution { name: String, message: String },

    #[error("function registry unavailable: {0}")]
    Unavailable(String),
}

/// Who a function runs on behalf of
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolContext {
    pub org: OrgId,
    pub actor: ActorId,
    pub role: Role,
}

#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Run `name` with already-parsed `arguments`
    ///
    /// Results are JSON-serializable values. A result shaped `{"error": ...}`
    /// is a valid answer, not a failure.
    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        context: &ToolContext,
    ) -> Result<Value, ToolError>;
}
