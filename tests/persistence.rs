//! Integration tests for the SQLite-backed deployment
//!
//! Each test seeds a database file, then drives the same entry points the
//! binary uses (`AppState::new` through `run_audit_cleanup`) against it.

use aigate::cli::run_audit_cleanup;
use aigate::config::Config;
use aigate::error::AppError;
use aigate::ids::{ActorId, ConversationId, OrgId};
use aigate::store::{
    AuditEntry, AuditStore, Conversation, ConversationStore, DataAccessSummary, SqliteStore,
    UsageRecord, UsageStore,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

const ORG: &str = "org-1";

fn config_for(db: &Path) -> Config {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = 3000

[functions]
registry_url = "http://localhost:8080/api/ai/functions"

[store]
path = "{}"

[[organizations]]
id = "org-1"
name = "Acme"
monthly_token_budget = 1000

[[actors]]
id = "admin-1"
org = "org-1"
role = "admin"
"#,
        db.display()
    )
    .parse()
    .expect("test config should be valid")
}

fn usage(tokens: u64, at: DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        id: Uuid::new_v4(),
        org: OrgId::new(ORG),
        actor: ActorId::new("admin-1"),
        prompt_tokens: tokens,
        completion_tokens: 0,
        total_tokens: tokens,
        model: "gpt-4o-mini".into(),
        cost_usd: 0.0,
        timestamp: at,
    }
}

fn audit(flagged: bool, at: DateTime<Utc>) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4(),
        org: OrgId::new(ORG),
        actor: ActorId::new("admin-1"),
        conversation_id: None,
        query_hash: "0".repeat(64),
        query_length: 5,
        functions_called: Vec::new(),
        data_access: DataAccessSummary::default(),
        tokens_used: 10,
        response_time_ms: 100,
        ip: None,
        user_agent: None,
        flagged,
        flag_reasons: if flagged {
            vec!["INJECTION_ATTEMPT".into()]
        } else {
            Vec::new()
        },
        risk_score: if flagged { 40 } else { 0 },
        created_at: at,
    }
}

fn db_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("aigate.db")
}

#[tokio::test]
async fn test_cleanup_runs_against_the_configured_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let now = Utc::now();
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_audit(audit(false, now - TimeDelta::days(200))).await.unwrap();
        store.insert_audit(audit(true, now - TimeDelta::days(200))).await.unwrap();
        store.insert_audit(audit(false, now)).await.unwrap();
        store.insert_usage(usage(50, now - TimeDelta::days(100))).await.unwrap();
        store.insert_usage(usage(50, now)).await.unwrap();
        store
            .insert_conversation(Conversation {
                id: ConversationId::new(),
                org: OrgId::new(ORG),
                owner: ActorId::new("admin-1"),
                title: "old chat".into(),
                created_at: now - TimeDelta::days(40),
                updated_at: now - TimeDelta::days(40),
                expires_at: Some(now - TimeDelta::days(10)),
            })
            .await
            .unwrap();
    }

    let report = run_audit_cleanup(config_for(&path), Some(90)).await.unwrap();
    assert_eq!(report.organizations_checked, 1);
    assert_eq!(report.audit_entries_deleted, 1);
    assert_eq!(report.usage_records_deleted, 1);
    assert_eq!(report.conversations_deleted, 1);
    assert_eq!(report.failures, 0);

    // The flagged entry and this month's records remain on disk
    let store = SqliteStore::open(&path).unwrap();
    let org = OrgId::new(ORG);
    assert_eq!(store.flagged_audit_entries(&org, 10).await.unwrap().len(), 1);
    assert_eq!(
        store
            .audit_entries_between(&org, now - TimeDelta::days(1), now + TimeDelta::days(1))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .sum_org_tokens_since(&org, now - TimeDelta::days(365))
            .await
            .unwrap(),
        50
    );
}

#[tokio::test]
async fn test_budget_alerts_are_not_repeated_after_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_usage(usage(800, Utc::now())).await.unwrap();
    }

    // Two passes with separate service graphs and connections
    let first = run_audit_cleanup(config_for(&path), None).await.unwrap();
    let second = run_audit_cleanup(config_for(&path), None).await.unwrap();

    assert_eq!(first.alerts_sent, 1);
    assert_eq!(second.alerts_sent, 0);
}

#[tokio::test]
async fn test_cleanup_requires_a_store_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&db_path(&dir));
    config.store.path = None;

    let err = run_audit_cleanup(config, None).await.unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().contains("[store] path"));
}

#[tokio::test]
async fn test_cleanup_rejects_zero_retention() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_audit_cleanup(config_for(&db_path(&dir)), Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}
