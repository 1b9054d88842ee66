//! Command-line interface for aigate
//!
//! Provides argument parsing and subcommand handling for the aigate binary.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::handlers::AppState;
use crate::maintenance::MaintenanceReport;
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// Governed AI assistant service for multi-tenant business apps
#[derive(Parser)]
#[command(name = "aigate")]
#[command(version)]
#[command(about = "Governed AI assistant service for multi-tenant business apps")]
#[command(
    long_about = "aigate admits, screens, meters, audits and orchestrates tool-calling \
    AI assistant turns on behalf of many organizations sharing a token budget."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Run one maintenance pass (audit retention, expired chats, budget alerts) and exit
    AuditCleanup {
        /// Override audit.retention_days from the configuration
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# aigate Configuration
# =====================
#
# This file configures the HTTP server, the LLM provider, admission limits,
# input screening, auditing and the tenants served by aigate.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER CONFIGURATION
# ─────────────────────────────────────────────────────────────────────────────

[server]
# IP address to bind to (0.0.0.0 for all interfaces, 127.0.0.1 for localhost only)
host = "0.0.0.0"

# Port to listen on
port = 3000

# Upper bound for one request, in seconds
request_timeout_seconds = 60

# ─────────────────────────────────────────────────────────────────────────────
# LLM PROVIDER (OpenAI-compatible /chat/completions)
# ─────────────────────────────────────────────────────────────────────────────

[provider]
base_url = "https://api.openai.com/v1"
# Environment variable holding the API key
api_key_env = "OPENAI_API_KEY"
model = "gpt-4o-mini"
temperature = 0.3
max_tokens = 1024
timeout_seconds = 60

[retry]
# Total attempts for transient failures (timeouts, 429, 5xx), including the first
max_attempts = 3
# Base backoff in milliseconds, doubled per retry
backoff_ms = 250

# ─────────────────────────────────────────────────────────────────────────────
# ADMISSION LIMITS
# ─────────────────────────────────────────────────────────────────────────────
#
# Deployment caps beat tier defaults. They can also be set with
# AIGATE_HOURLY_REQUEST_LIMIT, AIGATE_DAILY_TOKEN_LIMIT and
# AIGATE_MONTHLY_TOKEN_LIMIT. An organization's monthly_token_budget beats
# everything.

[limits]
max_concurrent = 3
read_only_hourly = 120
# hourly_requests = 50
# daily_tokens = 20000
# monthly_tokens = 200000

[limits.free]
hourly_requests = 30
daily_tokens = 10000
monthly_tokens = 100000

[limits.plus]
hourly_requests = 100
daily_tokens = 50000
monthly_tokens = 500000

# ─────────────────────────────────────────────────────────────────────────────
# INPUT SCREENING, CHAT AND AUDIT
# ─────────────────────────────────────────────────────────────────────────────

[sanitizer]
max_input_length = 4000
# Replace the builtin injection pattern table:
# patterns_file = "patterns.toml"

[chat]
# Prior messages replayed as context
history_limit = 20
title_max_chars = 50

[audit]
# Days non-flagged audit entries are kept (flagged entries are kept forever)
retention_days = 90

[maintenance]
# Budget alerts, audit and usage retention, expired conversation cleanup
enabled = true
interval_seconds = 900

[store]
# SQLite database for usage, audit, conversations and alert markers.
# Remove to keep records in memory only (lost on restart).
path = "aigate.db"

# Prices in USD per million tokens, merged over the builtin table
[pricing.models."gpt-4o-mini"]
input_per_million = 0.15
output_per_million = 0.6

# ─────────────────────────────────────────────────────────────────────────────
# HOST APPLICATION
# ─────────────────────────────────────────────────────────────────────────────

[functions]
# Tool calls are POSTed to {registry_url}/{function_name}
registry_url = "http://localhost:8080/api/ai/functions"
# api_key_env = "AIGATE_FUNCTIONS_KEY"
timeout_seconds = 30
# Replace the builtin function catalog:
# catalog_file = "functions.toml"

[notifications]
# Budget alerts are POSTed here; when unset they are only logged
# webhook_url = "http://localhost:8080/api/notifications"
timeout_seconds = 10

# Which data domains each role may query
# [permissions.role_domains]
# member = ["leave", "assets", "documents", "organization"]

[[organizations]]
id = "org-1"
name = "Example Co"
tier = "free"
# monthly_token_budget = 150000
# Days conversations are kept; 0 keeps them forever
chat_retention_days = 30

[[actors]]
id = "user-1"
org = "org-1"
role = "admin"
display_name = "Example Admin"

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"

# Prometheus metrics are always available at /metrics on the server port
# For production, consider using a reverse proxy to restrict access
"#
}

/// One maintenance pass over the configured database
///
/// Refuses to run without a `[store] path`: a fresh in-memory store holds
/// nothing to clean.
pub async fn run_audit_cleanup(
    mut config: Config,
    retention_days: Option<u32>,
) -> AppResult<MaintenanceReport> {
    if config.store.path.is_none() {
        return Err(AppError::Config(
            "audit-cleanup needs a [store] path in the configuration".to_string(),
        ));
    }
    if let Some(days) = retention_days {
        if days == 0 {
            return Err(AppError::Validation(
                "--retention-days must be at least 1".to_string(),
            ));
        }
        config.audit.retention_days = days;
    }

    let state = AppState::new(Arc::new(config))?;
    let maintenance = state
        .maintenance()
        .ok_or_else(|| AppError::Internal("maintenance is not wired".to_string()))?;
    Ok(maintenance.run_once().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Clap's built-in verification for the CLI structure
        Cli::command().debug_assert();
    }

    #[test]
    fn default_config_path() {
        let cli = Cli::parse_from(["aigate"]);
        assert_eq!(cli.config, "config.toml");
        assert!(cli.command.is_none());
    }

    #[test]
    fn custom_config_path() {
        let cli = Cli::parse_from(["aigate", "--config", "custom.toml"]);
        assert_eq!(cli.config, "custom.toml");
    }

    #[test]
    fn config_subcommand_with_output() {
        let cli = Cli::parse_from(["aigate", "config", "-o", "my-config.toml"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config { output: Some(ref path) }) if path == "my-config.toml"
        ));
    }

    #[test]
    fn audit_cleanup_subcommand() {
        let cli = Cli::parse_from(["aigate", "audit-cleanup", "--retention-days", "30"]);
        assert!(matches!(
            cli.command,
            Some(Command::AuditCleanup {
                retention_days: Some(30)
            })
        ));
    }

    #[test]
    fn template_is_a_valid_config() {
        let config: Config = generate_config_template()
            .parse()
            .expect("template should parse and validate");
        assert_eq!(config.organizations.len(), 1);
        assert_eq!(config.actors.len(), 1);
    }
}
