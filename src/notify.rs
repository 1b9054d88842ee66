//! Notification sinks
//!
//! Budget alerts are delivered to org admins through a [`NotificationSink`].
//! The host application usually receives them over a webhook and turns them
//! into in-app notifications.

use crate::ids::{ActorId, OrgId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AiBudgetAlert,
}

/// A notification addressed to one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: ActorId,
    pub org: OrgId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Collects notifications in memory
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    sent: RwLock<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.write().await.push(notification);
        Ok(())
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient,
            org = %notification.org,
            kind = ?notification.kind,
            title = %notification.title,
            "Notification issued"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to the host application
pub struct WebhookNotificationSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification {
            id: Uuid::new_v4(),
            recipient: ActorId::from("admin-1"),
            org: OrgId::from("acme"),
            kind: NotificationKind::AiBudgetAlert,
            title: "AI budget at 75%".into(),
            message: "...".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_records_notifications() {
        let sink = MemoryNotificationSink::new();
        sink.notify(sample()).await.unwrap();
        assert_eq!(sink.sent().await.len(), 1);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["kind"], "ai_budget_alert");
    }
}
