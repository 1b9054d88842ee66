//! Prometheus metrics collection for aigate
//!
//! This module provides metrics instrumentation for tracking:
//! - Chat turns by outcome and mode, and their latency
//! - Rate-limit rejections by window
//! - Sanitizer flags by severity
//! - Tool calls by outcome
//! - LLM tokens consumed by kind
//! - Telemetry (usage/audit) write failures
//!
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.

use crate::limits::LimitKind;
use crate::sanitizer::Flag;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Request path a turn took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Sync,
    Stream,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::Sync => "sync",
            TurnMode::Stream => "stream",
        }
    }
}

/// Final state of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Responded,
    Blocked,
    RateLimited,
    UpstreamError,
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Responded => "responded",
            TurnOutcome::Blocked => "blocked",
            TurnOutcome::RateLimited => "rate_limited",
            TurnOutcome::UpstreamError => "upstream_error",
            TurnOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    Error,
    /// Rejected by the execution-time permission re-check
    Denied,
}

impl ToolOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolOutcome::Success => "success",
            ToolOutcome::Error => "error",
            ToolOutcome::Denied => "denied",
        }
    }
}

/// Best-effort writes whose failure never reaches the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryOperation {
    RecordUsage,
    WriteAudit,
    TouchConversation,
}

impl TelemetryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryOperation::RecordUsage => "record_usage",
            TelemetryOperation::WriteAudit => "write_audit",
            TelemetryOperation::TouchConversation => "touch_conversation",
        }
    }
}

/// Metrics collector for aigate
///
/// Every label is drawn from a closed enum, so cardinality is fixed at
/// compile time.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    turns_total: IntCounterVec,
    turn_duration: HistogramVec,
    rate_limit_rejections: IntCounterVec,
    sanitizer_flags: IntCounterVec,
    tool_calls: IntCounterVec,
    llm_tokens: IntCounterVec,
    telemetry_failures: IntCounterVec,
    background_task_failures: IntCounterVec,
    metrics_recording_failures: IntCounterVec,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Cardinality: 5 outcomes × 2 modes = 10 time series
        let turns_total = IntCounterVec::new(
            Opts::new(
                "aigate_chat_turns_total",
                "Total assistant turns by outcome and mode",
            ),
            &["outcome", "mode"],
        )?;

        let turn_duration = HistogramVec::new(
            HistogramOpts::new(
                "aigate_chat_turn_duration_seconds",
                "End-to-end assistant turn latency in seconds",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0]),
            &["mode"],
        )?;

        let rate_limit_rejections = IntCounterVec::new(
            Opts::new(
                "aigate_rate_limit_rejections_total",
                "Requests rejected by admission control, by window",
            ),
            &["window"],
        )?;

        let sanitizer_flags = IntCounterVec::new(
            Opts::new(
                "aigate_sanitizer_flags_total",
                "Sanitizer findings by severity (high, medium, low, truncated)",
            ),
            &["severity"],
        )?;

        let tool_calls = IntCounterVec::new(
            Opts::new("aigate_tool_calls_total", "Tool invocations by outcome"),
            &["outcome"],
        )?;

        let llm_tokens = IntCounterVec::new(
            Opts::new(
                "aigate_llm_tokens_total",
                "LLM tokens consumed, by kind (prompt, completion)",
            ),
            &["kind"],
        )?;

        // Alerting: any sustained rate means quotas and the audit trail drift
        // from reality, since both rely on these writes
        let telemetry_failures = IntCounterVec::new(
            Opts::new(
                "aigate_telemetry_failures_total",
                "Usage/audit writes that failed and were swallowed, by operation",
            ),
            &["operation"],
        )?;

        let background_task_failures = IntCounterVec::new(
            Opts::new(
                "aigate_background_task_failures_total",
                "Maintenance task failures (panic, unexpected_termination). \
                Alert on ANY increment.",
            ),
            &["failure_type"],
        )?;

        let metrics_recording_failures = IntCounterVec::new(
            Opts::new(
                "aigate_metrics_recording_failures_total",
                "Metrics recording operation failures by operation",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(turns_total.clone()))?;
        registry.register(Box::new(turn_duration.clone()))?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;
        registry.register(Box::new(sanitizer_flags.clone()))?;
        registry.register(Box::new(tool_calls.clone()))?;
        registry.register(Box::new(llm_tokens.clone()))?;
        registry.register(Box::new(telemetry_failures.clone()))?;
        registry.register(Box::new(background_task_failures.clone()))?;
        registry.register(Box::new(metrics_recording_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            turns_total,
            turn_duration,
            rate_limit_rejections,
            sanitizer_flags,
            tool_calls,
            llm_tokens,
            telemetry_failures,
            background_task_failures,
            metrics_recording_failures,
        })
    }

    /// Record a finished turn
    ///
    /// # Errors
    ///
    /// Returns an error if the metric is not registered, or if
    /// `duration_seconds` is NaN, infinite, or negative (these corrupt
    /// histogram percentiles).
    pub fn record_turn(
        &self,
        outcome: TurnOutcome,
        mode: TurnMode,
        duration_seconds: f64,
    ) -> Result<(), prometheus::Error> {
        if !duration_seconds.is_finite() || duration_seconds < 0.0 {
            return Err(prometheus::Error::Msg(format!(
                "Histogram value must be finite and non-negative, got: {}",
                duration_seconds
            )));
        }
        self.turns_total
            .get_metric_with_label_values(&[outcome.as_str(), mode.as_str()])?
            .inc();
        self.turn_duration
            .get_metric_with_label_values(&[mode.as_str()])?
            .observe(duration_seconds);
        Ok(())
    }

    /// [`record_turn`](Self::record_turn), logging instead of failing
    pub fn turn(&self, outcome: TurnOutcome, mode: TurnMode, duration_seconds: f64) {
        if let Err(e) = self.record_turn(outcome, mode, duration_seconds) {
            tracing::warn!(
                error = %e,
                outcome = outcome.as_str(),
                mode = mode.as_str(),
                "Metrics recording failed (request continues)"
            );
            self.metrics_recording_failure("record_turn");
        }
    }

    pub fn rate_limited(&self, kind: LimitKind) {
        self.rate_limit_rejections
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn sanitizer_flags(&self, flags: &[Flag]) {
        for flag in flags {
            let severity = flag.severity().map(|s| s.as_str()).unwrap_or("truncated");
            self.sanitizer_flags.with_label_values(&[severity]).inc();
        }
    }

    pub fn tool_call(&self, outcome: ToolOutcome) {
        self.tool_calls.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn llm_tokens(&self, prompt: u64, completion: u64) {
        self.llm_tokens.with_label_values(&["prompt"]).inc_by(prompt);
        self.llm_tokens
            .with_label_values(&["completion"])
            .inc_by(completion);
    }

    pub fn telemetry_failure(&self, operation: TelemetryOperation) {
        self.telemetry_failures
            .with_label_values(&[operation.as_str()])
            .inc();
    }

    /// Total swallowed telemetry failures since startup (used by /health)
    pub fn telemetry_failures_count(&self) -> u64 {
        self.sum_counter("aigate_telemetry_failures_total")
    }

    pub fn background_task_failure(&self, failure_type: &str) {
        self.background_task_failures
            .with_label_values(&[failure_type])
            .inc();
    }

    pub fn background_task_failures_count(&self) -> u64 {
        self.sum_counter("aigate_background_task_failures_total")
    }

    pub fn metrics_recording_failure(&self, operation: &str) {
        self.metrics_recording_failures
            .with_label_values(&[operation])
            .inc();
    }

    pub fn metrics_recording_failures_count(&self) -> u64 {
        self.sum_counter("aigate_metrics_recording_failures_total")
    }

    fn sum_counter(&self, name: &str) -> u64 {
        self.registry
            .gather()
            .iter()
            .find(|mf| mf.name() == name)
            .map(|mf| {
                mf.get_metric()
                    .iter()
                    .map(|m| m.counter.value.unwrap_or(0.0) as u64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Gather all metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the output is not valid UTF-8.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let metric_count = metric_families.len();

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            tracing::error!(
                error = %e,
                metric_family_count = metric_count,
                "Prometheus text encoder failed"
            );
            prometheus::Error::Msg(format!(
                "Failed to encode {} metric families: {}",
                metric_count, e
            ))
        })?;

        String::from_utf8(buffer).map_err(|e| {
            let valid_up_to = e.utf8_error().valid_up_to();
            tracing::error!(
                invalid_byte_index = valid_up_to,
                "Prometheus encoder produced invalid UTF-8"
            );
            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}",
                valid_up_to, e
            ))
        })
    }
}
