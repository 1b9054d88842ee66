//! Persistence seams
//!
//! The core never owns a schema. It talks to four record families through
//! async traits so the host application can back them with its own database:
//!
//! - [`UsageStore`]: append-only LLM usage, the single source of truth for
//!   every quota and budget calculation
//! - [`ConversationStore`]: conversations and their append-only messages
//! - [`AuditStore`]: privacy-preserving audit trail
//! - [`AlertMarkerStore`]: "already notified" markers for budget thresholds
//!
//! [`SqliteStore`] implements all four on a local database file and is what
//! a configured deployment runs on. [`MemoryStore`] implements them in
//! process memory for tests and throwaway instances.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::ids::{ActorId, ConversationId, OrgId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors raised by store implementations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One metered LLM call
///
/// Immutable once written. An orchestrator turn writes one record per
/// provider call, so a turn with tool use writes two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub org: OrgId,
    pub actor: ActorId,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: String,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// A conversation owned by one actor inside one organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub org: OrgId,
    pub owner: ActorId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// Record of one tool invocation made during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallTrace {
    /// Provider-assigned tool call id
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
    pub success: bool,
    pub duration_ms: u64,
}

/// A persisted conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCallTrace>,
    pub created_at: DateTime<Utc>,
}

/// What data a turn touched, without the data itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataAccessSummary {
    pub entity_types: Vec<String>,
    pub record_count: u64,
    pub sensitive_data: bool,
}

/// Audit record for one user-facing turn
///
/// The raw query is never stored, only its hash and length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub org: OrgId,
    pub actor: ActorId,
    pub conversation_id: Option<ConversationId>,
    pub query_hash: String,
    pub query_length: usize,
    pub functions_called: Vec<String>,
    pub data_access: DataAccessSummary,
    pub tokens_used: u64,
    pub response_time_ms: u64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub flagged: bool,
    pub flag_reasons: Vec<String>,
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
}

/// Marks that `threshold` was already announced for `org` in `period_key`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetAlertMarker {
    pub org: OrgId,
    pub threshold: u8,
    /// `YYYY-MM` of the UTC month the alert belongs to
    pub period_key: String,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_usage(&self, record: UsageRecord) -> StoreResult<()>;

    /// Number of usage records written for `actor` at or after `since`
    async fn count_actor_calls_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn sum_actor_tokens_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn sum_org_tokens_since(&self, org: &OrgId, since: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete records written before `cutoff`
    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_conversation(&self, conversation: Conversation) -> StoreResult<()>;

    async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    async fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>)
    -> StoreResult<()>;

    /// Conversations of `owner` in `org`, most recently updated first
    async fn conversations_for(
        &self,
        owner: &ActorId,
        org: &OrgId,
    ) -> StoreResult<Vec<Conversation>>;

    /// Delete a conversation and its messages; false if it did not exist
    async fn delete_conversation(&self, id: ConversationId) -> StoreResult<bool>;

    async fn append_message(&self, message: StoredMessage) -> StoreResult<()>;

    /// The last `limit` messages of a conversation, oldest first
    async fn recent_messages(
        &self,
        id: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>>;

    async fn messages(&self, id: ConversationId) -> StoreResult<Vec<StoredMessage>>;

    /// Delete every conversation whose expiry is at or before `now`
    async fn delete_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: AuditEntry) -> StoreResult<()>;

    /// Entries for `org` created in `[start, end)`
    async fn audit_entries_between(
        &self,
        org: &OrgId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>>;

    /// Most recent flagged entries for `org`, newest first
    async fn flagged_audit_entries(&self, org: &OrgId, limit: usize)
    -> StoreResult<Vec<AuditEntry>>;

    /// Delete non-flagged entries created before `cutoff`
    async fn delete_unflagged_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait AlertMarkerStore: Send + Sync {
    async fn marker_exists(&self, org: &OrgId, threshold: u8, period_key: &str)
    -> StoreResult<bool>;

    /// Insert a marker; false if an identical marker already existed
    async fn insert_marker(&self, marker: BudgetAlertMarker) -> StoreResult<bool>;

    async fn delete_markers(&self, org: &OrgId) -> StoreResult<u64>;
}
