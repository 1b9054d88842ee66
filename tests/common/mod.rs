//! Shared fixtures for integration tests
//!
//! Builds a full [`Assistant`] over in-memory stores with a scripted LLM
//! provider, a canned function registry, and a manual clock pinned to a
//! known instant.

#![allow(dead_code)]

use aigate::assistant::{Assistant, Caller};
use aigate::audit::AuditLogger;
use aigate::budget::BudgetTracker;
use aigate::chat::{ChatOrchestrator, ChatSettings};
use aigate::clock::{Clock, ManualClock};
use aigate::directory::{Actor, Directory, Organization, Role, StaticDirectory, SubscriptionTier};
use aigate::ids::{ActorId, OrgId};
use aigate::limits::{LimitPolicy, RateLimiter};
use aigate::maintenance::Maintenance;
use aigate::metrics::Metrics;
use aigate::notify::MemoryNotificationSink;
use aigate::permissions::{FunctionCatalog, PermissionFilter, RoleDomains};
use aigate::provider::{
    Completion, CompletionRequest, CompletionStream, FunctionCall, LlmProvider, ProviderError,
    StreamDelta, TokenUsage, ToolCall,
};
use aigate::sanitizer::InputSanitizer;
use aigate::store::{
    AuditEntry, AuditStore, MemoryStore, StoreError, StoreResult, UsageRecord, UsageStore,
};
use aigate::tools::{FunctionRegistry, ToolContext, ToolError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ORG: &str = "org-1";
pub const OTHER_ORG: &str = "org-2";
pub const ADMIN: &str = "admin-1";
pub const MANAGER: &str = "manager-1";
pub const MEMBER: &str = "member-1";
pub const OUTSIDER: &str = "outsider-1";
pub const MODEL: &str = "gpt-4o-mini";

/// Mid-month, mid-day: far from every window boundary
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 10, 30, 0).unwrap()
}

pub fn organization(id: &str, tier: SubscriptionTier) -> Organization {
    Organization {
        id: OrgId::new(id),
        name: format!("{} Inc", id),
        tier,
        monthly_token_budget: None,
        chat_retention_days: 30,
    }
}

pub fn actor(id: &str, org: &str, role: Role) -> Actor {
    Actor {
        id: ActorId::new(id),
        org: OrgId::new(org),
        role,
        display_name: Some(format!("User {}", id)),
    }
}

pub fn caller(actor_id: &str, org_id: &str) -> Caller {
    Caller {
        actor_id: ActorId::new(actor_id),
        org_id: OrgId::new(org_id),
        ip: Some("203.0.113.7".to_string()),
        user_agent: Some("integration-test".to_string()),
        request_id: None,
    }
}

pub fn completion(content: &str, prompt: u64, completion_tokens: u64) -> Completion {
    Completion {
        model: MODEL.to_string(),
        content: Some(content.to_string()),
        tool_calls: Vec::new(),
        usage: TokenUsage::new(prompt, completion_tokens),
        finish_reason: Some("stop".to_string()),
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        kind: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}

pub fn tool_completion(calls: Vec<ToolCall>, prompt: u64, completion_tokens: u64) -> Completion {
    Completion {
        model: MODEL.to_string(),
        content: None,
        tool_calls: calls,
        usage: TokenUsage::new(prompt, completion_tokens),
        finish_reason: Some("tool_calls".to_string()),
    }
}

/// LLM provider that replays queued answers and records every request
#[derive(Default)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamDelta, ProviderError>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    /// Delay before each completion and each streamed delta
    latency: Mutex<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, completion: Completion) {
        self.completions.lock().unwrap().push_back(Ok(completion));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.completions.lock().unwrap().push_back(Err(error));
    }

    pub fn push_stream(&self, deltas: Vec<Result<StreamDelta, ProviderError>>) {
        self.streams.lock().unwrap().push_back(deltas);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::InvalidResponse("script exhausted".into())))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let deltas = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("stream script exhausted".into()))?;
        let latency = *self.latency.lock().unwrap();
        let deltas = futures::stream::iter(deltas);
        if latency.is_zero() {
            return Ok(deltas.boxed());
        }
        Ok(deltas
            .then(move |delta| async move {
                tokio::time::sleep(latency).await;
                delta
            })
            .boxed())
    }
}

/// Function registry answering from a fixed table
#[derive(Default)]
pub struct CannedRegistry {
    results: HashMap<String, Value>,
    calls: Mutex<Vec<(String, Value, ToolContext)>>,
}

impl CannedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, result: Value) -> Self {
        self.results.insert(name.to_string(), result);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value, ToolContext)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionRegistry for CannedRegistry {
    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments, context.clone()));
        self.results
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownFunction(name.to_string()))
    }
}

/// Usage store whose writes always fail; reads delegate to memory
pub struct FailingUsageStore {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl UsageStore for FailingUsageStore {
    async fn insert_usage(&self, _record: UsageRecord) -> StoreResult<()> {
        Err(StoreError::Unavailable("usage table locked".into()))
    }

    async fn count_actor_calls_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.inner.count_actor_calls_since(actor, since).await
    }

    async fn sum_actor_tokens_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.inner.sum_actor_tokens_since(actor, since).await
    }

    async fn sum_org_tokens_since(&self, org: &OrgId, since: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.sum_org_tokens_since(org, since).await
    }

    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.delete_usage_before(cutoff).await
    }
}

/// Audit store that rejects every write
pub struct FailingAuditStore;

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn insert_audit(&self, _entry: AuditEntry) -> StoreResult<()> {
        Err(StoreError::Unavailable("audit table locked".into()))
    }

    async fn audit_entries_between(
        &self,
        _org: &OrgId,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>> {
        Ok(Vec::new())
    }

    async fn flagged_audit_entries(
        &self,
        _org: &OrgId,
        _limit: usize,
    ) -> StoreResult<Vec<AuditEntry>> {
        Ok(Vec::new())
    }

    async fn delete_unflagged_before(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
        Err(StoreError::Unavailable("audit table locked".into()))
    }
}

pub struct HarnessOptions {
    pub organizations: Vec<Organization>,
    pub actors: Vec<Actor>,
    pub policy: LimitPolicy,
    pub registry: CannedRegistry,
    pub fail_usage_writes: bool,
    pub fail_audit_writes: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            organizations: vec![
                organization(ORG, SubscriptionTier::Free),
                organization(OTHER_ORG, SubscriptionTier::Plus),
            ],
            actors: vec![
                actor(ADMIN, ORG, Role::Admin),
                actor(MANAGER, ORG, Role::Manager),
                actor(MEMBER, ORG, Role::Member),
                actor(OUTSIDER, OTHER_ORG, Role::Owner),
            ],
            policy: LimitPolicy::default(),
            registry: CannedRegistry::new(),
            fail_usage_writes: false,
            fail_audit_writes: false,
        }
    }
}

/// A fully wired assistant plus handles on everything it touches
pub struct Harness {
    pub assistant: Arc<Assistant>,
    pub provider: Arc<ScriptedProvider>,
    pub registry: Arc<CannedRegistry>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotificationSink>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<Metrics>,
    pub limiter: Arc<RateLimiter>,
    pub budget: Arc<BudgetTracker>,
    pub audit: Arc<AuditLogger>,
    pub maintenance: Arc<Maintenance>,
    pub directory: Arc<dyn Directory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HarnessOptions::default())
    }

    pub fn with(options: HarnessOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(test_now()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let metrics = Arc::new(Metrics::new().unwrap());
        let provider = Arc::new(ScriptedProvider::new());
        let registry = Arc::new(options.registry);
        let notifier = Arc::new(MemoryNotificationSink::new());
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::new(
            options.organizations,
            options.actors,
        ));

        let usage_store: Arc<dyn UsageStore> = if options.fail_usage_writes {
            Arc::new(FailingUsageStore {
                inner: store.clone(),
            })
        } else {
            store.clone()
        };
        let audit_store: Arc<dyn AuditStore> = if options.fail_audit_writes {
            Arc::new(FailingAuditStore)
        } else {
            store.clone()
        };

        let limiter = Arc::new(RateLimiter::new(
            usage_store.clone(),
            dyn_clock.clone(),
            options.policy,
        ));
        let audit = Arc::new(AuditLogger::new(audit_store, dyn_clock.clone()));
        let budget = Arc::new(BudgetTracker::new(
            limiter.clone(),
            store.clone(),
            directory.clone(),
            notifier.clone(),
            dyn_clock.clone(),
        ));
        let permissions = Arc::new(PermissionFilter::new(
            FunctionCatalog::builtin(),
            RoleDomains::default(),
        ));
        let orchestrator = Arc::new(
            ChatOrchestrator::new(
                provider.clone(),
                registry.clone(),
                permissions,
                store.clone(),
                usage_store,
                dyn_clock.clone(),
                metrics.clone(),
            )
            .with_settings(ChatSettings {
                model: MODEL.to_string(),
                ..ChatSettings::default()
            }),
        );
        let assistant = Arc::new(Assistant::new(
            directory.clone(),
            limiter.clone(),
            Arc::new(InputSanitizer::default()),
            orchestrator,
            audit.clone(),
            budget.clone(),
            metrics.clone(),
        ));
        let maintenance = Arc::new(Maintenance::new(
            directory.clone(),
            budget.clone(),
            audit.clone(),
            store.clone(),
            store.clone(),
            dyn_clock,
            metrics.clone(),
            90,
            Duration::from_secs(900),
        ));

        Self {
            assistant,
            provider,
            registry,
            store,
            notifier,
            clock,
            metrics,
            limiter,
            budget,
            audit,
            maintenance,
            directory,
        }
    }

    /// Write a usage record as if a past turn had spent `tokens`
    pub async fn spend(&self, actor_id: &str, org_id: &str, tokens: u64) {
        self.store
            .insert_usage(UsageRecord {
                id: uuid::Uuid::new_v4(),
                org: OrgId::new(org_id),
                actor: ActorId::new(actor_id),
                prompt_tokens: tokens,
                completion_tokens: 0,
                total_tokens: tokens,
                model: MODEL.to_string(),
                cost_usd: 0.0,
                timestamp: self.clock.now(),
            })
            .await
            .unwrap();
    }

    /// Audit entries once at least `count` exist
    ///
    /// Turns finish on their own task, so a caller that stopped waiting
    /// observes the records a little later.
    pub async fn wait_for_audit_entries(&self, count: usize) -> Vec<AuditEntry> {
        for _ in 0..500 {
            let entries = self.store.audit_entries().await;
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} audit entries within 5s", count);
    }

    pub async fn organization(&self, id: &str) -> Organization {
        self.directory
            .organization(&OrgId::new(id))
            .await
            .unwrap()
            .unwrap()
    }
}
