//! Function registry reached over HTTP
//!
//! Each invocation is a `POST {base_url}/{name}` with a JSON body of
//! `{"arguments": ..., "context": {...}}`. A 404 means the host does not know
//! the function; any other non-2xx status is an execution failure.

use super::{FunctionRegistry, ToolContext, ToolError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub struct HttpFunctionRegistry {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct Invocation<'a> {
    arguments: &'a Value,
    context: &'a ToolContext,
}

impl HttpFunctionRegistry {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }
}

#[async_trait]
impl FunctionRegistry for HttpFunctionRegistry {
    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let url = format!("{}/{}", self.base_url, name);
        let mut request = self.http.post(&url).json(&Invocation {
            arguments: &arguments,
            context,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolError::UnknownFunction(name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Execution {
                name: name.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()),
            });
        }

        response.json::<Value>().await.map_err(|e| ToolError::Execution {
            name: name.to_string(),
            message: format!("invalid JSON result: {}", e),
        })
    }
}
