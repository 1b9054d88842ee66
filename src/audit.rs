//! Privacy-preserving audit trail
//!
//! One [`AuditEntry`] per user-facing turn. The raw query is never stored:
//! entries carry its SHA-256 digest and length, the functions that ran, and a
//! summary of what kind of data they touched.
//!
//! Retention is asymmetric. Ordinary entries are purged after a window;
//! flagged entries are kept indefinitely for review.

use crate::clock::Clock;
use crate::ids::{ActorId, ConversationId, OrgId};
use crate::sanitizer::SanitizationResult;
use crate::store::{AuditEntry, AuditStore, DataAccessSummary, StoreResult};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 90;

/// Risk score at or above which an entry is flagged
pub const FLAG_RISK_THRESHOLD: u8 = 30;

const TOP_FUNCTIONS: usize = 10;

/// Function name to the entity type it reads
const ENTITY_TYPES: &[(&str, &str)] = &[
    ("get_organization_overview", "organization"),
    ("search_employees", "employee"),
    ("get_employee_details", "employee"),
    ("get_employee_count", "employee"),
    ("get_employee_salary", "salary"),
    ("get_payroll_summary", "payroll"),
    ("get_employee_loans", "loan"),
    ("get_leave_balance", "leave_balance"),
    ("get_leave_requests", "leave_request"),
    ("search_assets", "asset"),
    ("get_asset_details", "asset"),
    ("get_subscriptions", "subscription"),
    ("get_upcoming_renewals", "subscription"),
    ("get_purchase_requests", "purchase_request"),
    ("search_documents", "document"),
    ("get_expiring_documents", "document"),
];

const SENSITIVE_FUNCTIONS: &[&str] = &[
    "get_employee_salary",
    "get_payroll_summary",
    "get_employee_loans",
    "get_leave_balance",
];

/// One-way digest of the user's query
pub fn hash_query(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn entity_type(function: &str) -> Option<&'static str> {
    ENTITY_TYPES
        .iter()
        .find(|(name, _)| *name == function)
        .map(|(_, entity)| *entity)
}

/// What a turn touched, derived from function names and their results
pub fn extract_data_access_summary(functions_called: &[String], results: &[Value]) -> DataAccessSummary {
    let mut entity_types: Vec<String> = Vec::new();
    for function in functions_called {
        let entity = entity_type(function).unwrap_or("other");
        if !entity_types.iter().any(|e| e == entity) {
            entity_types.push(entity.to_string());
        }
    }

    DataAccessSummary {
        entity_types,
        record_count: results.iter().map(record_count).sum(),
        sensitive_data: functions_called
            .iter()
            .any(|f| SENSITIVE_FUNCTIONS.contains(&f.as_str())),
    }
}

/// Records in one function result
///
/// Arrays count their items. Objects report `count` or `total` when present,
/// otherwise the items of their array fields, otherwise one record. Error
/// results and scalars count zero.
fn record_count(result: &Value) -> u64 {
    match result {
        Value::Array(items) => items.len() as u64,
        Value::Object(map) => {
            if map.contains_key("error") {
                return 0;
            }
            if let Some(n) = ["count", "total"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_u64))
            {
                return n;
            }
            let nested: u64 = map
                .values()
                .filter_map(Value::as_array)
                .map(|a| a.len() as u64)
                .sum();
            let has_arrays = map.values().any(Value::is_array);
            if has_arrays {
                nested
            } else if map.is_empty() {
                0
            } else {
                1
            }
        }
        _ => 0,
    }
}

/// Everything known about a turn when it is audited
#[derive(Debug, Clone, Default)]
pub struct AuditInput {
    pub org: OrgId,
    pub actor: ActorId,
    pub conversation_id: Option<ConversationId>,
    /// Raw query; only hashed and measured
    pub query: String,
    pub functions_called: Vec<String>,
    pub function_results: Vec<Value>,
    pub tokens_used: u64,
    pub response_time_ms: u64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub sanitization: Option<SanitizationResult>,
    /// Reasons beyond sanitizer flags, e.g. a hard block
    pub extra_flag_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionUsage {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_queries: u64,
    pub flagged_queries: u64,
    pub unique_actors: u64,
    pub average_risk_score: f64,
    pub top_functions: Vec<FunctionUsage>,
}

pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Build and persist the entry for one turn
    pub async fn log_audit_entry(&self, input: AuditInput) -> StoreResult<AuditEntry> {
        let risk_score = input
            .sanitization
            .as_ref()
            .map(SanitizationResult::risk_score)
            .unwrap_or(0);
        let sanitizer_flagged = input.sanitization.as_ref().is_some_and(|s| s.flagged);
        let flagged = risk_score >= FLAG_RISK_THRESHOLD
            || sanitizer_flagged
            || !input.extra_flag_reasons.is_empty();

        let mut flag_reasons = input
            .sanitization
            .as_ref()
            .map(SanitizationResult::flag_strings)
            .unwrap_or_default();
        flag_reasons.extend(input.extra_flag_reasons);

        let data_access =
            extract_data_access_summary(&input.functions_called, &input.function_results);

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            org: input.org,
            actor: input.actor,
            conversation_id: input.conversation_id,
            query_hash: hash_query(&input.query),
            query_length: input.query.chars().count(),
            functions_called: input.functions_called,
            data_access,
            tokens_used: input.tokens_used,
            response_time_ms: input.response_time_ms,
            ip: input.ip,
            user_agent: input.user_agent,
            flagged,
            flag_reasons,
            risk_score,
            created_at: self.clock.now(),
        };

        if entry.flagged {
            tracing::warn!(
                org = %entry.org,
                actor = %entry.actor,
                risk_score = entry.risk_score,
                flag_reasons = ?entry.flag_reasons,
                functions_called = ?entry.functions_called,
                sensitive_data = entry.data_access.sensitive_data,
                "Flagged AI interaction"
            );
        }

        self.store.insert_audit(entry.clone()).await?;
        Ok(entry)
    }

    /// Aggregate entries created in `[start, end)`
    pub async fn audit_summary(
        &self,
        org: &OrgId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<AuditSummary> {
        let entries = self.store.audit_entries_between(org, start, end).await?;

        let total_queries = entries.len() as u64;
        let flagged_queries = entries.iter().filter(|e| e.flagged).count() as u64;
        let unique_actors = entries
            .iter()
            .map(|e| &e.actor)
            .collect::<HashSet<_>>()
            .len() as u64;
        let average_risk_score = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|e| e.risk_score as f64).sum::<f64>() / entries.len() as f64
        };

        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for name in entries.iter().flat_map(|e| e.functions_called.iter()) {
            *counts.entry(name.as_str()).or_default() += 1;
        }
        let mut top_functions: Vec<FunctionUsage> = counts
            .into_iter()
            .map(|(name, count)| FunctionUsage {
                name: name.to_string(),
                count,
            })
            .collect();
        // BTreeMap order is by name, so the stable sort keeps ties alphabetical
        top_functions.sort_by(|a, b| b.count.cmp(&a.count));
        top_functions.truncate(TOP_FUNCTIONS);

        Ok(AuditSummary {
            total_queries,
            flagged_queries,
            unique_actors,
            average_risk_score,
            top_functions,
        })
    }

    /// Most recent flagged entries for manual review
    pub async fn flagged_queries(&self, org: &OrgId, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        self.store.flagged_audit_entries(org, limit).await
    }

    /// Delete non-flagged entries older than `retention_days`
    pub async fn cleanup_old_audit_logs(&self, retention_days: u32) -> StoreResult<u64> {
        let cutoff = self.clock.now() - TimeDelta::days(i64::from(retention_days));
        let deleted = self.store.delete_unflagged_before(cutoff).await?;
        tracing::info!(
            retention_days,
            cutoff = %cutoff,
            deleted,
            "Audit retention cleanup finished"
        );
        Ok(deleted)
    }
}
