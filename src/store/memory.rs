//! Process-local store backed by `tokio::sync::RwLock`ed collections
//!
//! Nothing survives a restart. Used by tests and by instances started
//! without a `[store] path`.

use super::{
    AlertMarkerStore, AuditEntry, AuditStore, BudgetAlertMarker, Conversation, ConversationStore,
    StoreResult, StoredMessage, UsageRecord, UsageStore,
};
use crate::ids::{ActorId, ConversationId, OrgId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct ConversationTable {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<StoredMessage>>,
}

/// In-memory implementation of every store trait
#[derive(Default)]
pub struct MemoryStore {
    usage: RwLock<Vec<UsageRecord>>,
    conversations: RwLock<ConversationTable>,
    audit: RwLock<Vec<AuditEntry>>,
    markers: RwLock<HashSet<BudgetAlertMarker>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every usage record (test and export helper)
    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }

    /// Snapshot of every audit entry (test and export helper)
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_usage(&self, record: UsageRecord) -> StoreResult<()> {
        self.usage.write().await.push(record);
        Ok(())
    }

    async fn count_actor_calls_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| &r.actor == actor && r.timestamp >= since)
            .count() as u64)
    }

    async fn sum_actor_tokens_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| &r.actor == actor && r.timestamp >= since)
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn sum_org_tokens_since(&self, org: &OrgId, since: DateTime<Utc>) -> StoreResult<u64> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| &r.org == org && r.timestamp >= since)
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut usage = self.usage.write().await;
        let before = usage.len();
        usage.retain(|r| r.timestamp >= cutoff);
        Ok((before - usage.len()) as u64)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_conversation(&self, conversation: Conversation) -> StoreResult<()> {
        let mut table = self.conversations.write().await;
        table.messages.entry(conversation.id).or_default();
        table.conversations.insert(conversation.id, conversation);
        Ok(())
    }

    async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.conversations.read().await.conversations.get(&id).cloned())
    }

    async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(conversation) = self.conversations.write().await.conversations.get_mut(&id) {
            conversation.updated_at = at;
        }
        Ok(())
    }

    async fn conversations_for(
        &self,
        owner: &ActorId,
        org: &OrgId,
    ) -> StoreResult<Vec<Conversation>> {
        let table = self.conversations.read().await;
        let mut found: Vec<Conversation> = table
            .conversations
            .values()
            .filter(|c| &c.owner == owner && &c.org == org)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }

    async fn delete_conversation(&self, id: ConversationId) -> StoreResult<bool> {
        let mut table = self.conversations.write().await;
        table.messages.remove(&id);
        Ok(table.conversations.remove(&id).is_some())
    }

    async fn append_message(&self, message: StoredMessage) -> StoreResult<()> {
        self.conversations
            .write()
            .await
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn recent_messages(
        &self,
        id: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let table = self.conversations.read().await;
        let Some(messages) = table.messages.get(&id) else {
            return Ok(Vec::new());
        };
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn messages(&self, id: ConversationId) -> StoreResult<Vec<StoredMessage>> {
        let table = self.conversations.read().await;
        Ok(table.messages.get(&id).cloned().unwrap_or_default())
    }

    async fn delete_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut table = self.conversations.write().await;
        let expired: Vec<ConversationId> = table
            .conversations
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id)
            .collect();
        for id in &expired {
            table.conversations.remove(id);
            table.messages.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn audit_entries_between(
        &self,
        org: &OrgId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>> {
        let audit = self.audit.read().await;
        Ok(audit
            .iter()
            .filter(|e| &e.org == org && e.created_at >= start && e.created_at < end)
            .cloned()
            .collect())
    }

    async fn flagged_audit_entries(
        &self,
        org: &OrgId,
        limit: usize,
    ) -> StoreResult<Vec<AuditEntry>> {
        let audit = self.audit.read().await;
        let mut flagged: Vec<AuditEntry> = audit
            .iter()
            .filter(|e| &e.org == org && e.flagged)
            .cloned()
            .collect();
        flagged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        flagged.truncate(limit);
        Ok(flagged)
    }

    async fn delete_unflagged_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut audit = self.audit.write().await;
        let before = audit.len();
        audit.retain(|e| e.flagged || e.created_at >= cutoff);
        Ok((before - audit.len()) as u64)
    }
}

#[async_trait]
impl AlertMarkerStore for MemoryStore {
    async fn marker_exists(
        &self,
        org: &OrgId,
        threshold: u8,
        period_key: &str,
    ) -> StoreResult<bool> {
        let markers = self.markers.read().await;
        Ok(markers
            .iter()
            .any(|m| &m.org == org && m.threshold == threshold && m.period_key == period_key))
    }

    async fn insert_marker(&self, marker: BudgetAlertMarker) -> StoreResult<bool> {
        Ok(self.markers.write().await.insert(marker))
    }

    async fn delete_markers(&self, org: &OrgId) -> StoreResult<u64> {
        let mut markers = self.markers.write().await;
        let before = markers.len();
        markers.retain(|m| &m.org != org);
        Ok((before - markers.len()) as u64)
    }
}
