//! SQLite-backed store
//!
//! One connection in WAL mode behind a mutex. Every call runs on the blocking
//! pool. Timestamps are stored as UTC microseconds and list-valued fields as
//! JSON text.

use super::{
    AlertMarkerStore, AuditEntry, AuditStore, BudgetAlertMarker, Conversation, ConversationStore,
    DataAccessSummary, MessageRole, StoreError, StoreResult, StoredMessage, UsageRecord,
    UsageStore,
};
use crate::ids::{ActorId, ConversationId, OrgId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Persistent implementation of every store trait
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

impl SqliteStore {
    /// Open or create the database at `path` and bring the schema up to date
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("cannot open database {}: {}", path.display(), e))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let store = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "Opened SQLite store");
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("database mutex poisoned".to_string()))?;
            f(&*conn).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("database task failed: {}", e)))?
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id                  TEXT PRIMARY KEY,
    org_id              TEXT NOT NULL,
    actor_id            TEXT NOT NULL,
    prompt_tokens       INTEGER NOT NULL,
    completion_tokens   INTEGER NOT NULL,
    total_tokens        INTEGER NOT NULL,
    model               TEXT NOT NULL,
    cost_usd            REAL NOT NULL DEFAULT 0.0,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_actor_created ON usage_records(actor_id, created_at);
CREATE INDEX IF NOT EXISTS idx_usage_org_created ON usage_records(org_id, created_at);

CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    org_id      TEXT NOT NULL,
    owner_id    TEXT NOT NULL,
    title       TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    expires_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner_id, org_id);
CREATE INDEX IF NOT EXISTS idx_conversations_expires ON conversations(expires_at);

CREATE TABLE IF NOT EXISTS messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'tool')),
    content         TEXT NOT NULL,
    function_calls  TEXT NOT NULL DEFAULT '[]',
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);

CREATE TABLE IF NOT EXISTS audit_entries (
    id                  TEXT PRIMARY KEY,
    org_id              TEXT NOT NULL,
    actor_id            TEXT NOT NULL,
    conversation_id     TEXT,
    query_hash          TEXT NOT NULL,
    query_length        INTEGER NOT NULL,
    functions_called    TEXT NOT NULL DEFAULT '[]',
    entity_types        TEXT NOT NULL DEFAULT '[]',
    record_count        INTEGER NOT NULL DEFAULT 0,
    sensitive_data      INTEGER NOT NULL DEFAULT 0,
    tokens_used         INTEGER NOT NULL DEFAULT 0,
    response_time_ms    INTEGER NOT NULL DEFAULT 0,
    ip                  TEXT,
    user_agent          TEXT,
    flagged             INTEGER NOT NULL DEFAULT 0,
    flag_reasons        TEXT NOT NULL DEFAULT '[]',
    risk_score          INTEGER NOT NULL DEFAULT 0,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_org_created ON audit_entries(org_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_flagged ON audit_entries(org_id, flagged, created_at);

CREATE TABLE IF NOT EXISTS budget_alert_markers (
    org_id      TEXT NOT NULL,
    threshold   INTEGER NOT NULL,
    period_key  TEXT NOT NULL,
    PRIMARY KEY (org_id, threshold, period_key)
);
"#;

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn timestamp_at(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(column)?;
    DateTime::from_timestamp_micros(raw)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, raw))
}

fn uuid_at(row: &Row<'_>, column: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(column, e))
}

fn conversation_id_at(row: &Row<'_>, column: usize) -> rusqlite::Result<ConversationId> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| conversion_error(column, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(column, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn role_at(row: &Row<'_>, column: usize) -> rusqlite::Result<MessageRole> {
    let raw: String = row.get(column)?;
    match raw.as_str() {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        "tool" => Ok(MessageRole::Tool),
        _ => Err(rusqlite::Error::InvalidColumnType(column, raw, Type::Text)),
    }
}

const CONVERSATION_COLUMNS: &str =
    "id, org_id, owner_id, title, created_at, updated_at, expires_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let expires_at = match row.get::<_, Option<i64>>(6)? {
        Some(_) => Some(timestamp_at(row, 6)?),
        None => None,
    };
    Ok(Conversation {
        id: conversation_id_at(row, 0)?,
        org: OrgId::new(row.get::<_, String>(1)?),
        owner: ActorId::new(row.get::<_, String>(2)?),
        title: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
        expires_at,
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, function_calls, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: uuid_at(row, 0)?,
        conversation_id: conversation_id_at(row, 1)?,
        role: role_at(row, 2)?,
        content: row.get(3)?,
        function_calls: json_at(row, 4)?,
        created_at: timestamp_at(row, 5)?,
    })
}

const AUDIT_COLUMNS: &str = "id, org_id, actor_id, conversation_id, query_hash, query_length, \
     functions_called, entity_types, record_count, sensitive_data, tokens_used, \
     response_time_ms, ip, user_agent, flagged, flag_reasons, risk_score, created_at";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let conversation_id = match row.get::<_, Option<String>>(3)? {
        Some(raw) => Some(raw.parse().map_err(|e| conversion_error(3, e))?),
        None => None,
    };
    Ok(AuditEntry {
        id: uuid_at(row, 0)?,
        org: OrgId::new(row.get::<_, String>(1)?),
        actor: ActorId::new(row.get::<_, String>(2)?),
        conversation_id,
        query_hash: row.get(4)?,
        query_length: row.get::<_, i64>(5)? as usize,
        functions_called: json_at(row, 6)?,
        data_access: DataAccessSummary {
            entity_types: json_at(row, 7)?,
            record_count: row.get::<_, i64>(8)? as u64,
            sensitive_data: row.get(9)?,
        },
        tokens_used: row.get::<_, i64>(10)? as u64,
        response_time_ms: row.get::<_, i64>(11)? as u64,
        ip: row.get(12)?,
        user_agent: row.get(13)?,
        flagged: row.get(14)?,
        flag_reasons: json_at(row, 15)?,
        risk_score: row.get(16)?,
        created_at: timestamp_at(row, 17)?,
    })
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_usage(&self, record: UsageRecord) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (id, org_id, actor_id, prompt_tokens, completion_tokens, \
                 total_tokens, model, cost_usd, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.org.as_str(),
                    record.actor.as_str(),
                    record.prompt_tokens as i64,
                    record.completion_tokens as i64,
                    record.total_tokens as i64,
                    record.model,
                    record.cost_usd,
                    micros(record.timestamp),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_actor_calls_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let actor = actor.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM usage_records WHERE actor_id = ?1 AND created_at >= ?2",
                params![actor, micros(since)],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    async fn sum_actor_tokens_since(
        &self,
        actor: &ActorId,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let actor = actor.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_records \
                 WHERE actor_id = ?1 AND created_at >= ?2",
                params![actor, micros(since)],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    async fn sum_org_tokens_since(&self, org: &OrgId, since: DateTime<Utc>) -> StoreResult<u64> {
        let org = org.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_records \
                 WHERE org_id = ?1 AND created_at >= ?2",
                params![org, micros(since)],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM usage_records WHERE created_at < ?1",
                params![micros(cutoff)],
            )
            .map(|n| n as u64)
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn insert_conversation(&self, conversation: Conversation) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, org_id, owner_id, title, created_at, updated_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conversation.id.to_string(),
                    conversation.org.as_str(),
                    conversation.owner.as_str(),
                    conversation.title,
                    micros(conversation.created_at),
                    micros(conversation.updated_at),
                    conversation.expires_at.map(micros),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
                params![id.to_string()],
                conversation_from_row,
            )
            .optional()
        })
        .await
    }

    async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![micros(at), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn conversations_for(
        &self,
        owner: &ActorId,
        org: &OrgId,
    ) -> StoreResult<Vec<Conversation>> {
        let owner = owner.as_str().to_string();
        let org = org.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations WHERE owner_id = ?1 AND org_id = ?2 \
                 ORDER BY updated_at DESC",
                CONVERSATION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![owner, org], conversation_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn delete_conversation(&self, id: ConversationId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                params![id.to_string()],
            )?;
            let deleted = tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![id.to_string()],
            )?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn append_message(&self, message: StoredMessage) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, function_calls, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    role_str(message.role),
                    message.content,
                    to_json(&message.function_calls)?,
                    micros(message.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_messages(
        &self,
        id: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM (\
                   SELECT seq, {cols} FROM messages WHERE conversation_id = ?1 \
                   ORDER BY seq DESC LIMIT ?2\
                 ) ORDER BY seq ASC",
                cols = MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![id.to_string(), limit.min(i64::MAX as usize) as i64],
                message_from_row,
            )?;
            rows.collect()
        })
        .await
    }

    async fn messages(&self, id: ConversationId) -> StoreResult<Vec<StoredMessage>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![id.to_string()], message_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn delete_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id IN \
                 (SELECT id FROM conversations WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
                params![micros(now)],
            )?;
            let deleted = tx.execute(
                "DELETE FROM conversations WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![micros(now)],
            )?;
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn insert_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO audit_entries ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    AUDIT_COLUMNS
                ),
                params![
                    entry.id.to_string(),
                    entry.org.as_str(),
                    entry.actor.as_str(),
                    entry.conversation_id.map(|id| id.to_string()),
                    entry.query_hash,
                    entry.query_length as i64,
                    to_json(&entry.functions_called)?,
                    to_json(&entry.data_access.entity_types)?,
                    entry.data_access.record_count as i64,
                    entry.data_access.sensitive_data,
                    entry.tokens_used as i64,
                    entry.response_time_ms as i64,
                    entry.ip,
                    entry.user_agent,
                    entry.flagged,
                    to_json(&entry.flag_reasons)?,
                    entry.risk_score,
                    micros(entry.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn audit_entries_between(
        &self,
        org: &OrgId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>> {
        let org = org.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_entries \
                 WHERE org_id = ?1 AND created_at >= ?2 AND created_at < ?3 \
                 ORDER BY created_at ASC",
                AUDIT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![org, micros(start), micros(end)], audit_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn flagged_audit_entries(
        &self,
        org: &OrgId,
        limit: usize,
    ) -> StoreResult<Vec<AuditEntry>> {
        let org = org.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_entries WHERE org_id = ?1 AND flagged = 1 \
                 ORDER BY created_at DESC LIMIT ?2",
                AUDIT_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![org, limit.min(i64::MAX as usize) as i64],
                audit_from_row,
            )?;
            rows.collect()
        })
        .await
    }

    async fn delete_unflagged_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM audit_entries WHERE flagged = 0 AND created_at < ?1",
                params![micros(cutoff)],
            )
            .map(|n| n as u64)
        })
        .await
    }
}

#[async_trait]
impl AlertMarkerStore for SqliteStore {
    async fn marker_exists(
        &self,
        org: &OrgId,
        threshold: u8,
        period_key: &str,
    ) -> StoreResult<bool> {
        let org = org.as_str().to_string();
        let period_key = period_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM budget_alert_markers \
                 WHERE org_id = ?1 AND threshold = ?2 AND period_key = ?3",
                params![org, threshold, period_key],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
        .await
    }

    async fn insert_marker(&self, marker: BudgetAlertMarker) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO budget_alert_markers (org_id, threshold, period_key) \
                 VALUES (?1, ?2, ?3)",
                params![marker.org.as_str(), marker.threshold, marker.period_key],
            )
            .map(|inserted| inserted > 0)
        })
        .await
    }

    async fn delete_markers(&self, org: &OrgId) -> StoreResult<u64> {
        let org = org.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM budget_alert_markers WHERE org_id = ?1",
                params![org],
            )
            .map(|n| n as u64)
        })
        .await
    }
}
