//! HTTP request handlers for the aigate API

use crate::assistant::Assistant;
use crate::audit::AuditLogger;
use crate::budget::BudgetTracker;
use crate::chat::ChatOrchestrator;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::directory::{Directory, StaticDirectory};
use crate::error::{AppError, AppResult};
use crate::limits::RateLimiter;
use crate::maintenance::Maintenance;
use crate::metrics::Metrics;
use crate::middleware::request_id_middleware;
use crate::notify::{LogNotificationSink, NotificationSink, WebhookNotificationSink};
use crate::permissions::{FunctionCatalog, PermissionFilter, RoleDomains};
use crate::provider::{LlmProvider, OpenAiProvider, PricingTable, RetryingProvider};
use crate::sanitizer::{InputSanitizer, PatternTable};
use crate::store::{
    AlertMarkerStore, AuditStore, ConversationStore, MemoryStore, SqliteStore, UsageStore,
};
use crate::tools::{FunctionRegistry, HttpFunctionRegistry};
use axum::{
    Router,
    extract::rejection::{JsonRejection, QueryRejection},
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub mod audit;
pub mod chat;
pub mod conversations;
pub mod health;
pub mod metrics;
pub mod stream;
pub mod usage;

/// Application state shared across all handlers
///
/// All fields are Arc'd for cheap cloning across Axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    assistant: Arc<Assistant>,
    metrics: Arc<Metrics>,
    maintenance: Option<Arc<Maintenance>>,
}

impl AppState {
    /// Build the full service graph from configuration
    ///
    /// Records go to the SQLite database named by `[store] path`, or to a
    /// process-local [`MemoryStore`] when none is set. Actors and
    /// organizations come from the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the database cannot be opened, a
    /// pattern table or catalog file is invalid, or an HTTP client cannot be
    /// built.
    pub fn new(config: Arc<Config>) -> AppResult<Self> {
        match &config.store.path {
            Some(path) => {
                let store = SqliteStore::open(path).map_err(|e| {
                    AppError::Config(format!("Failed to open store at {}: {}", path, e))
                })?;
                Self::with_store(config.clone(), Arc::new(store))
            }
            None => {
                tracing::warn!(
                    "No [store] path configured; usage, audit and conversation records \
                     are kept in memory and lost on restart"
                );
                Self::with_store(config.clone(), Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Build the service graph over an existing store
    pub fn with_store<S>(config: Arc<Config>, store: Arc<S>) -> AppResult<Self>
    where
        S: UsageStore + ConversationStore + AuditStore + AlertMarkerStore + 'static,
    {
        let metrics = Arc::new(
            Metrics::new()
                .map_err(|e| AppError::Internal(format!("Failed to initialize metrics: {}", e)))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::new(
            config.organizations.clone(),
            config.actors.clone(),
        ));

        let patterns = match &config.sanitizer.patterns_file {
            Some(path) => PatternTable::from_file(path)?,
            None => PatternTable::builtin(),
        };
        let sanitizer = Arc::new(InputSanitizer::new(
            patterns,
            config.sanitizer.max_input_length,
        ));

        let catalog = match &config.functions.catalog_file {
            Some(path) => FunctionCatalog::from_file(path)?,
            None => FunctionCatalog::builtin(),
        };
        let permissions = Arc::new(PermissionFilter::new(
            catalog,
            RoleDomains::with_overrides(config.permissions.overrides()?),
        ));

        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.limits.policy(),
        ));

        let openai = OpenAiProvider::new(
            config.provider.base_url.clone(),
            config.provider.api_key(),
            Duration::from_secs(config.provider.timeout_seconds),
        )
        .map_err(|e| AppError::Config(e.to_string()))?;
        if config.provider.api_key().is_none() {
            tracing::warn!(
                api_key_env = %config.provider.api_key_env,
                "No provider API key set; requests are sent unauthenticated"
            );
        }
        let provider: Arc<dyn LlmProvider> = Arc::new(RetryingProvider::new(
            Arc::new(openai),
            config.retry.policy()?,
        ));

        let registry: Arc<dyn FunctionRegistry> = Arc::new(
            HttpFunctionRegistry::new(
                config.functions.registry_url.clone(),
                config.functions.api_key(),
                Duration::from_secs(config.functions.timeout_seconds),
            )
            .map_err(|e| AppError::Config(e.to_string()))?,
        );

        let notifier: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(
                WebhookNotificationSink::new(
                    url.clone(),
                    Duration::from_secs(config.notifications.timeout_seconds),
                )
                .map_err(|e| AppError::Config(e.to_string()))?,
            ),
            None => Arc::new(LogNotificationSink),
        };

        let audit = Arc::new(AuditLogger::new(store.clone(), clock.clone()));
        let budget = Arc::new(BudgetTracker::new(
            limiter.clone(),
            store.clone(),
            directory.clone(),
            notifier,
            clock.clone(),
        ));

        let orchestrator = Arc::new(
            ChatOrchestrator::new(
                provider,
                registry,
                permissions,
                store.clone(),
                store.clone(),
                clock.clone(),
                metrics.clone(),
            )
            .with_settings(config.chat_settings())
            .with_pricing(PricingTable::with_overrides(config.pricing.models.clone())),
        );

        let assistant = Arc::new(Assistant::new(
            directory.clone(),
            limiter,
            sanitizer,
            orchestrator,
            audit.clone(),
            budget.clone(),
            metrics.clone(),
        ));

        let maintenance = Arc::new(Maintenance::new(
            directory,
            budget,
            audit,
            store.clone(),
            store,
            clock,
            metrics.clone(),
            config.audit.retention_days,
            Duration::from_secs(config.maintenance.interval_seconds),
        ));

        Ok(Self {
            config,
            assistant,
            metrics,
            maintenance: Some(maintenance),
        })
    }

    /// Assemble state from prebuilt services (tests, embedding)
    pub fn from_parts(config: Arc<Config>, assistant: Arc<Assistant>) -> Self {
        let metrics = assistant.metrics().clone();
        Self {
            config,
            assistant,
            metrics,
            maintenance: None,
        }
    }

    /// Get reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn assistant(&self) -> &Arc<Assistant> {
        &self.assistant
    }

    /// Get reference to the metrics collector
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn maintenance(&self) -> Option<&Arc<Maintenance>> {
        self.maintenance.as_ref()
    }
}

/// Every route, with request IDs and HTTP tracing
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ai/chat", post(chat::handler))
        .route("/ai/chat/stream", post(stream::handler))
        .route("/ai/usage", get(usage::usage))
        .route("/ai/budget", get(usage::budget))
        .route("/ai/budget/alerts/reset", post(usage::reset_alerts))
        .route("/ai/audit/summary", get(audit::summary))
        .route("/ai/audit/flagged", get(audit::flagged))
        .route("/ai/conversations", get(conversations::list))
        .route(
            "/ai/conversations/{id}/messages",
            get(conversations::messages),
        )
        .route("/ai/conversations/{id}", delete(conversations::remove))
        .route("/health", get(health::handler))
        .route("/metrics", get(metrics::handler))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body rejections become JSON validation errors
pub(crate) fn invalid_json(rejection: JsonRejection) -> AppError {
    AppError::Validation(rejection.body_text())
}

pub(crate) fn invalid_query(rejection: QueryRejection) -> AppError {
    AppError::Validation(rejection.body_text())
}

pub(crate) fn parse_conversation_id(raw: &str) -> AppResult<crate::ids::ConversationId> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("invalid conversation id '{}'", raw)))
}
