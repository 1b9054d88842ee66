//! Bounded retry for transient provider failures
//!
//! Only the provider call itself is retried. Tool execution happens outside
//! the provider, so a retried completion never re-runs a tool.

use super::{Completion, CompletionRequest, CompletionStream, LlmProvider, ProviderError};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Default total attempts, including the first
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
/// Default base backoff in milliseconds (doubles each retry)
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
/// Maximum backoff duration in milliseconds
///
/// Caps the exponential growth. With base=250ms attempt 8 would be 32s,
/// which is clamped to 30s.
pub const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (must be at least 1)
    max_attempts: usize,
    /// Base backoff in milliseconds (doubles each retry)
    backoff_ms: u64,
}

impl RetryPolicy {
    /// # Errors
    /// Returns an error if `max_attempts` is 0 (at least 1 attempt is required)
    pub fn new(max_attempts: usize, backoff_ms: u64) -> Result<Self, &'static str> {
        if max_attempts == 0 {
            return Err("max_attempts must be at least 1");
        }
        Ok(Self {
            max_attempts,
            backoff_ms,
        })
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    /// Exponential backoff for `attempt` (1-indexed): `base * 2^(attempt-1)`,
    /// capped at [`MAX_BACKOFF_MS`]
    pub fn backoff_for(&self, attempt: usize) -> u64 {
        let exponent = (attempt as u32).saturating_sub(1);
        self.backoff_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(MAX_BACKOFF_MS)
    }

    /// Backoff plus up to 25% random jitter
    fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.backoff_for(attempt);
        let jitter = if base >= 4 {
            rand::rng().random_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(MAX_BACKOFF_MS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS)
            .expect("default RetryPolicy values must be valid")
    }
}

/// Decorator adding bounded retries to any provider
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn pause(&self, attempt: usize, err: &ProviderError, operation: &'static str) {
        let delay = self.policy.delay_for(attempt);
        tracing::warn!(
            operation,
            attempt,
            max_attempts = self.policy.max_attempts(),
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Transient provider failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts() => {
                    self.pause(attempt, &err, "complete").await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Retries opening the stream only; once bytes flow, failures surface to the caller
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.inner.stream(request).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts() => {
                    self.pause(attempt, &err, "stream").await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
