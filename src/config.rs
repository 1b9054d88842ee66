//! Configuration management for aigate
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Loading runs in three phases (read, parse, validate), each with its own
//! error variant. The three deployment-wide caps can also be set from the
//! environment, which wins over the file.

use crate::chat::{ChatSettings, MAX_MESSAGE_LENGTH};
use crate::directory::{Actor, Organization, Role};
use crate::error::{AppError, AppResult};
use crate::limits::{LimitOverrides, LimitPolicy, TierLimits};
use crate::permissions::Domain;
use crate::provider::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS, ModelPrice, RetryPolicy};
use crate::sanitizer::DEFAULT_MAX_INPUT_LENGTH;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// Environment variable overriding `limits.daily_tokens`
pub const ENV_DAILY_TOKEN_LIMIT: &str = "AIGATE_DAILY_TOKEN_LIMIT";
/// Environment variable overriding `limits.monthly_tokens`
pub const ENV_MONTHLY_TOKEN_LIMIT: &str = "AIGATE_MONTHLY_TOKEN_LIMIT";
/// Environment variable overriding `limits.hourly_requests`
pub const ENV_HOURLY_REQUEST_LIMIT: &str = "AIGATE_HOURLY_REQUEST_LIMIT";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub actors: Vec<Actor>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    60
}

/// OpenAI-compatible LLM provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    /// API key from the configured environment variable, if set and non-empty
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_provider_timeout() -> u64 {
    60
}

/// Bounded retry of transient provider failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> AppResult<RetryPolicy> {
        RetryPolicy::new(self.max_attempts, self.backoff_ms)
            .map_err(|e| AppError::Config(format!("retry: {}", e)))
    }
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

/// Admission control
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_read_only_hourly")]
    pub read_only_hourly: u64,
    /// Deployment caps; each beats every tier default
    #[serde(default)]
    pub hourly_requests: Option<u64>,
    #[serde(default)]
    pub daily_tokens: Option<u64>,
    #[serde(default)]
    pub monthly_tokens: Option<u64>,
    #[serde(default = "default_free_limits")]
    pub free: TierLimits,
    #[serde(default = "default_plus_limits")]
    pub plus: TierLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            read_only_hourly: default_read_only_hourly(),
            hourly_requests: None,
            daily_tokens: None,
            monthly_tokens: None,
            free: default_free_limits(),
            plus: default_plus_limits(),
        }
    }
}

impl LimitsConfig {
    pub fn policy(&self) -> LimitPolicy {
        LimitPolicy {
            max_concurrent: self.max_concurrent,
            read_only_hourly: self.read_only_hourly,
            free: self.free,
            plus: self.plus,
            overrides: LimitOverrides {
                hourly_requests: self.hourly_requests,
                daily_tokens: self.daily_tokens,
                monthly_tokens: self.monthly_tokens,
            },
        }
    }
}

fn default_max_concurrent() -> u32 {
    crate::limits::DEFAULT_MAX_CONCURRENT
}

fn default_read_only_hourly() -> u64 {
    crate::limits::DEFAULT_READ_ONLY_HOURLY_LIMIT
}

fn default_free_limits() -> TierLimits {
    TierLimits::FREE
}

fn default_plus_limits() -> TierLimits {
    TierLimits::PLUS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SanitizerConfig {
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    /// Replaces the builtin injection pattern table
    #[serde(default)]
    pub patterns_file: Option<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_input_length: default_max_input_length(),
            patterns_file: None,
        }
    }
}

fn default_max_input_length() -> usize {
    DEFAULT_MAX_INPUT_LENGTH
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

fn default_history_limit() -> usize {
    crate::chat::DEFAULT_HISTORY_LIMIT
}

fn default_title_max_chars() -> usize {
    crate::chat::conversation::DEFAULT_TITLE_MAX_CHARS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Days non-flagged entries are kept
    #[serde(default = "default_audit_retention")]
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_audit_retention(),
        }
    }
}

fn default_audit_retention() -> u32 {
    crate::audit::DEFAULT_AUDIT_RETENTION_DAYS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_maintenance_interval")]
    pub interval_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_maintenance_interval(),
        }
    }
}

/// Where usage, audit, conversation and alert-marker records live
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database file; records stay in memory when unset
    #[serde(default)]
    pub path: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval() -> u64 {
    crate::maintenance::DEFAULT_MAINTENANCE_INTERVAL_SECONDS
}

/// Per-model prices, merged over the builtin table
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
}

/// Host application's function registry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionsConfig {
    pub registry_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_functions_timeout")]
    pub timeout_seconds: u64,
    /// Replaces the builtin function catalog
    #[serde(default)]
    pub catalog_file: Option<String>,
}

impl FunctionsConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_functions_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationsConfig {
    /// Budget alerts are POSTed here; logged only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

/// Role to domain allow-list overrides, keyed by role name
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub role_domains: BTreeMap<String, Vec<Domain>>,
}

impl PermissionsConfig {
    pub fn overrides(&self) -> AppResult<HashMap<Role, Vec<Domain>>> {
        self.role_domains
            .iter()
            .map(|(name, domains)| {
                let role = Role::ALL
                    .into_iter()
                    .find(|r| r.as_str() == name)
                    .ok_or_else(|| {
                        AppError::Config(format!(
                            "permissions.role_domains has unknown role '{}'. \
                            Expected one of: owner, admin, manager, member",
                            name
                        ))
                    })?;
                Ok((role, domains.clone()))
            })
            .collect()
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let mut config: Self =
            toml::from_str(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?;

        // Phase 3: Environment overrides, then validation
        config
            .apply_env_overrides(|name| std::env::var(name).ok())
            .and_then(|_| config.validate())
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Apply the deployment cap variables; `lookup` is usually `std::env::var`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, slot) in [
            (ENV_HOURLY_REQUEST_LIMIT, &mut self.limits.hourly_requests),
            (ENV_DAILY_TOKEN_LIMIT, &mut self.limits.daily_tokens),
            (ENV_MONTHLY_TOKEN_LIMIT, &mut self.limits.monthly_tokens),
        ] {
            let Some(raw) = lookup(name) else { continue };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let value = raw.parse::<u64>().map_err(|_| {
                AppError::Config(format!(
                    "{} must be a positive integer, got '{}'",
                    name, raw
                ))
            })?;
            tracing::debug!(variable = name, value, "Applying limit override from environment");
            *slot = Some(value);
        }
        Ok(())
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.provider.model.clone(),
            temperature: Some(self.provider.temperature),
            max_tokens: Some(self.provider.max_tokens),
            history_limit: self.chat.history_limit,
            title_max_chars: self.chat.title_max_chars,
        }
    }

    /// Validate configuration after parsing
    ///
    /// This is called automatically by `from_file()`, but can also be called
    /// explicitly when constructing Config via other means (e.g., in tests).
    pub fn validate(&self) -> AppResult<()> {
        if self.server.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "Configuration error: request_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.server.request_timeout_seconds > 300 {
            return Err(AppError::Config(format!(
                "Configuration error: request_timeout_seconds cannot exceed 300 seconds (5 minutes), got {}",
                self.server.request_timeout_seconds
            )));
        }

        validate_url("provider.base_url", &self.provider.base_url)?;
        if self.provider.model.trim().is_empty() {
            return Err(AppError::Config(
                "Configuration error: provider.model cannot be empty".to_string(),
            ));
        }
        if !self.provider.temperature.is_finite()
            || !(0.0..=2.0).contains(&self.provider.temperature)
        {
            return Err(AppError::Config(format!(
                "Configuration error: provider.temperature must be a finite number between 0.0 and 2.0, got {}",
                self.provider.temperature
            )));
        }
        if self.provider.max_tokens == 0 {
            return Err(AppError::Config(
                "Configuration error: provider.max_tokens must be greater than 0".to_string(),
            ));
        }
        validate_timeout("provider.timeout_seconds", self.provider.timeout_seconds)?;

        if self.retry.max_attempts == 0 || self.retry.max_attempts > 10 {
            return Err(AppError::Config(format!(
                "Configuration error: retry.max_attempts must be between 1 and 10, got {}",
                self.retry.max_attempts
            )));
        }

        if self.limits.max_concurrent == 0 {
            return Err(AppError::Config(
                "Configuration error: limits.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.limits.read_only_hourly == 0 {
            return Err(AppError::Config(
                "Configuration error: limits.read_only_hourly must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("limits.hourly_requests", self.limits.hourly_requests),
            ("limits.daily_tokens", self.limits.daily_tokens),
            ("limits.monthly_tokens", self.limits.monthly_tokens),
        ] {
            if value == Some(0) {
                return Err(AppError::Config(format!(
                    "Configuration error: {} must be greater than 0 when set",
                    name
                )));
            }
        }
        for (tier, limits) in [("free", &self.limits.free), ("plus", &self.limits.plus)] {
            if limits.hourly_requests == 0 || limits.daily_tokens == 0 || limits.monthly_tokens == 0
            {
                return Err(AppError::Config(format!(
                    "Configuration error: every limit in limits.{} must be greater than 0",
                    tier
                )));
            }
        }

        if self.sanitizer.max_input_length == 0
            || self.sanitizer.max_input_length > MAX_MESSAGE_LENGTH
        {
            return Err(AppError::Config(format!(
                "Configuration error: sanitizer.max_input_length must be between 1 and {}, got {}",
                MAX_MESSAGE_LENGTH, self.sanitizer.max_input_length
            )));
        }

        if self.chat.history_limit > 100 {
            return Err(AppError::Config(format!(
                "Configuration error: chat.history_limit cannot exceed 100, got {}",
                self.chat.history_limit
            )));
        }
        if self.chat.title_max_chars < 10 {
            return Err(AppError::Config(format!(
                "Configuration error: chat.title_max_chars must be at least 10, got {}",
                self.chat.title_max_chars
            )));
        }

        if self.audit.retention_days == 0 {
            return Err(AppError::Config(
                "Configuration error: audit.retention_days must be at least 1".to_string(),
            ));
        }
        if let Some(path) = &self.store.path
            && path.trim().is_empty()
        {
            return Err(AppError::Config(
                "Configuration error: store.path cannot be empty when set".to_string(),
            ));
        }

        if self.maintenance.interval_seconds == 0 {
            return Err(AppError::Config(
                "Configuration error: maintenance.interval_seconds must be greater than 0"
                    .to_string(),
            ));
        }

        for (model, price) in &self.pricing.models {
            if !price.input_per_million.is_finite()
                || !price.output_per_million.is_finite()
                || price.input_per_million < 0.0
                || price.output_per_million < 0.0
            {
                return Err(AppError::Config(format!(
                    "Configuration error: pricing for model '{}' must be finite and non-negative",
                    model
                )));
            }
        }

        validate_url("functions.registry_url", &self.functions.registry_url)?;
        validate_timeout("functions.timeout_seconds", self.functions.timeout_seconds)?;

        if let Some(url) = &self.notifications.webhook_url {
            validate_url("notifications.webhook_url", url)?;
            validate_timeout(
                "notifications.timeout_seconds",
                self.notifications.timeout_seconds,
            )?;
        }

        self.permissions.overrides()?;

        let mut org_ids = HashSet::new();
        for org in &self.organizations {
            if org.id.as_str().trim().is_empty() {
                return Err(AppError::Config(
                    "Configuration error: organization id cannot be empty".to_string(),
                ));
            }
            if !org_ids.insert(&org.id) {
                return Err(AppError::Config(format!(
                    "Configuration error: duplicate organization id '{}'",
                    org.id
                )));
            }
        }
        let mut actor_ids = HashSet::new();
        for actor in &self.actors {
            if !actor_ids.insert(&actor.id) {
                return Err(AppError::Config(format!(
                    "Configuration error: duplicate actor id '{}'",
                    actor.id
                )));
            }
            if !org_ids.contains(&actor.org) {
                return Err(AppError::Config(format!(
                    "Configuration error: actor '{}' references unknown organization '{}'",
                    actor.id, actor.org
                )));
            }
        }

        Ok(())
    }
}

fn validate_url(field: &str, url: &str) -> AppResult<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::Config(format!(
            "Configuration error: {} '{}' must start with 'http://' or 'https://'",
            field, url
        )));
    }
    Ok(())
}

fn validate_timeout(field: &str, seconds: u64) -> AppResult<()> {
    if seconds == 0 || seconds > 300 {
        return Err(AppError::Config(format!(
            "Configuration error: {} must be between 1 and 300 seconds, got {}",
            field, seconds
        )));
    }
    Ok(())
}

impl FromStr for Config {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        // Validate config before returning
        config.validate()?;
        Ok(config)
    }
}
