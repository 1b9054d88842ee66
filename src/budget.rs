//! Organization budget status and threshold alerts
//!
//! Budget math reuses the limiter's monthly check, so the status shown to
//! admins and the limit enforced on chat requests can never disagree.

use crate::clock::Clock;
use crate::directory::{Directory, Organization};
use crate::error::AppResult;
use crate::ids::OrgId;
use crate::limits::{RateLimiter, window};
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::store::{AlertMarkerStore, BudgetAlertMarker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Percentages announced once per organization per month
pub const BUDGET_THRESHOLDS: [u8; 3] = [75, 90, 100];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub monthly_tokens_used: u64,
    pub monthly_token_limit: u64,
    pub percent_used: f64,
    pub is_over_budget: bool,
    /// Lowest threshold not reached yet
    pub next_threshold: Option<u8>,
}

impl BudgetStatus {
    fn new(used: u64, limit: u64) -> Self {
        let percent_used = if limit == 0 {
            100.0
        } else {
            used as f64 / limit as f64 * 100.0
        };
        Self {
            monthly_tokens_used: used,
            monthly_token_limit: limit,
            percent_used,
            is_over_budget: used >= limit,
            next_threshold: BUDGET_THRESHOLDS
                .into_iter()
                .find(|t| percent_used < f64::from(*t)),
        }
    }

    pub fn has_reached(&self, threshold: u8) -> bool {
        self.percent_used >= f64::from(threshold)
    }
}

pub struct BudgetTracker {
    limiter: Arc<RateLimiter>,
    markers: Arc<dyn AlertMarkerStore>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl BudgetTracker {
    pub fn new(
        limiter: Arc<RateLimiter>,
        markers: Arc<dyn AlertMarkerStore>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            markers,
            directory,
            notifier,
            clock,
        }
    }

    pub async fn budget_status(&self, org: &Organization) -> AppResult<BudgetStatus> {
        let monthly = self.limiter.check_monthly_tokens(org).await?;
        Ok(BudgetStatus::new(monthly.current, monthly.limit))
    }

    /// Send each newly crossed threshold alert to every org admin
    ///
    /// Returns the thresholds announced by this call. Delivery failures are
    /// logged; the marker is still written so the alert is not repeated.
    pub async fn check_budget_and_notify(&self, org: &Organization) -> AppResult<Vec<u8>> {
        let status = self.budget_status(org).await?;
        let now = self.clock.now();
        let period_key = window::period_key(now);
        let mut announced = Vec::new();

        for threshold in BUDGET_THRESHOLDS {
            if !status.has_reached(threshold)
                || self
                    .markers
                    .marker_exists(&org.id, threshold, &period_key)
                    .await?
            {
                continue;
            }

            let admins = match self.directory.org_admins(&org.id).await {
                Ok(admins) => admins,
                Err(e) => {
                    tracing::warn!(
                        org = %org.id,
                        threshold,
                        error = %e,
                        "Could not resolve org admins for budget alert, will retry next check"
                    );
                    continue;
                }
            };

            let (title, message) = alert_text(threshold, &status, now);
            for admin in &admins {
                let notification = Notification {
                    id: Uuid::new_v4(),
                    recipient: admin.id.clone(),
                    org: org.id.clone(),
                    kind: NotificationKind::AiBudgetAlert,
                    title: title.clone(),
                    message: message.clone(),
                    created_at: now,
                };
                if let Err(e) = self.notifier.notify(notification).await {
                    tracing::warn!(
                        org = %org.id,
                        recipient = %admin.id,
                        threshold,
                        error = %e,
                        "Budget alert delivery failed"
                    );
                }
            }

            let inserted = self
                .markers
                .insert_marker(BudgetAlertMarker {
                    org: org.id.clone(),
                    threshold,
                    period_key: period_key.clone(),
                })
                .await?;
            if inserted {
                tracing::info!(
                    org = %org.id,
                    threshold,
                    percent_used = status.percent_used,
                    recipients = admins.len(),
                    "Budget threshold alert sent"
                );
                announced.push(threshold);
            }
        }

        Ok(announced)
    }

    /// Forget every alert marker so thresholds can fire again
    pub async fn reset_monthly_alerts(&self, org: &OrgId) -> AppResult<u64> {
        let deleted = self.markers.delete_markers(org).await?;
        tracing::info!(org = %org, deleted, "Budget alert markers reset");
        Ok(deleted)
    }
}

fn alert_text(
    threshold: u8,
    status: &BudgetStatus,
    now: chrono::DateTime<chrono::Utc>,
) -> (String, String) {
    let usage = format!(
        "{} of {} tokens",
        status.monthly_tokens_used, status.monthly_token_limit
    );
    match threshold {
        100 => (
            "AI budget exceeded".to_string(),
            format!(
                "Your organization has used its entire monthly AI budget ({}). \
                 AI chat is limited until the budget resets on {} or an administrator raises it.",
                usage,
                window::next_month(now).format("%Y-%m-%d")
            ),
        ),
        90 => (
            "AI budget critical: 90% used".to_string(),
            format!(
                "Your organization has used 90% of its monthly AI budget ({}). \
                 Consider upgrading your plan or raising the budget to avoid interruptions.",
                usage
            ),
        ),
        t => (
            format!("AI budget at {}%", t),
            format!(
                "Your organization has used {}% of its monthly AI budget ({}).",
                t, usage
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_math() {
        let status = BudgetStatus::new(80, 100);
        assert!((status.percent_used - 80.0).abs() < f64::EPSILON);
        assert!(!status.is_over_budget);
        assert_eq!(status.next_threshold, Some(90));
        assert!(status.has_reached(75));
        assert!(!status.has_reached(90));
    }

    #[test]
    fn test_zero_limit_is_fully_used() {
        let status = BudgetStatus::new(0, 0);
        assert_eq!(status.percent_used, 100.0);
        assert!(status.is_over_budget);
        assert_eq!(status.next_threshold, None);
    }

    #[test]
    fn test_alert_text_escalates() {
        let status = BudgetStatus::new(95, 100);
        let now = chrono::Utc::now();
        assert!(alert_text(75, &status, now).1.contains("75%"));
        assert!(alert_text(90, &status, now).1.contains("upgrading"));
        assert!(alert_text(100, &status, now).1.contains("limited"));
    }
}
