//! Periodic housekeeping
//!
//! Budget threshold alerts are not evaluated per request. A background task
//! runs the budget check for every organization, purges old unflagged audit
//! entries, usage records older than the previous UTC month and expired
//! conversations on a fixed interval.

use crate::audit::AuditLogger;
use crate::budget::BudgetTracker;
use crate::clock::Clock;
use crate::directory::Directory;
use crate::limits::window;
use crate::metrics::Metrics;
use crate::store::{ConversationStore, UsageStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAINTENANCE_INTERVAL_SECONDS: u64 = 900;

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub organizations_checked: usize,
    pub alerts_sent: usize,
    pub audit_entries_deleted: u64,
    pub usage_records_deleted: u64,
    pub conversations_deleted: u64,
    /// Steps that failed; a failing step never stops the others
    pub failures: usize,
}

pub struct Maintenance {
    directory: Arc<dyn Directory>,
    budget: Arc<BudgetTracker>,
    audit: Arc<AuditLogger>,
    conversations: Arc<dyn ConversationStore>,
    usage: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    audit_retention_days: u32,
    interval: Duration,
}

impl Maintenance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn Directory>,
        budget: Arc<BudgetTracker>,
        audit: Arc<AuditLogger>,
        conversations: Arc<dyn ConversationStore>,
        usage: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        audit_retention_days: u32,
        interval: Duration,
    ) -> Self {
        Self {
            directory,
            budget,
            audit,
            conversations,
            usage,
            clock,
            metrics,
            audit_retention_days,
            interval,
        }
    }

    /// Run every housekeeping step once
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.directory.organizations().await {
            Ok(orgs) => {
                for org in &orgs {
                    report.organizations_checked += 1;
                    match self.budget.check_budget_and_notify(org).await {
                        Ok(announced) => report.alerts_sent += announced.len(),
                        Err(e) => {
                            report.failures += 1;
                            tracing::warn!(org = %org.id, error = %e, "Budget check failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "Could not list organizations for budget checks");
            }
        }

        match self
            .audit
            .cleanup_old_audit_logs(self.audit_retention_days)
            .await
        {
            Ok(deleted) => report.audit_entries_deleted = deleted,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "Audit retention cleanup failed");
            }
        }

        match self
            .usage
            .delete_usage_before(usage_cutoff(self.clock.now()))
            .await
        {
            Ok(deleted) => report.usage_records_deleted = deleted,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "Usage retention cleanup failed");
            }
        }

        match self
            .conversations
            .delete_expired_conversations(self.clock.now())
            .await
        {
            Ok(deleted) => report.conversations_deleted = deleted,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "Expired conversation cleanup failed");
            }
        }

        tracing::info!(
            organizations_checked = report.organizations_checked,
            alerts_sent = report.alerts_sent,
            audit_entries_deleted = report.audit_entries_deleted,
            usage_records_deleted = report.usage_records_deleted,
            conversations_deleted = report.conversations_deleted,
            failures = report.failures,
            "Maintenance pass finished"
        );
        report
    }

    /// Start the background task
    ///
    /// Also spawns a monitoring task to detect if the maintenance task stops.
    pub fn start(self: Arc<Self>) {
        let metrics = self.metrics.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_seconds = interval.as_secs(),
                "Starting background maintenance"
            );

            loop {
                tokio::time::sleep(interval).await;

                tracing::debug!("Running scheduled maintenance");
                self.run_once().await;
            }
        });

        tokio::spawn(async move {
            match handle.await {
                Ok(_) => {
                    metrics.background_task_failure("unexpected_termination");
                    tracing::error!(
                        "Background maintenance task terminated unexpectedly. \
                        Budget alerts and retention cleanup have stopped until server restart."
                    );
                }
                Err(e) => {
                    metrics.background_task_failure("panic");
                    tracing::error!(
                        error = %e,
                        "Background maintenance task panicked. \
                        Budget alerts and retention cleanup have stopped until server restart."
                    );
                }
            }
        });
    }
}

/// Start of the previous UTC month
///
/// Every quota window lies inside the current month, so older usage records
/// no longer count towards anything.
pub fn usage_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    window::month_start(window::month_start(now) - TimeDelta::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_usage_cutoff_keeps_the_previous_month() {
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap();
        assert_eq!(
            usage_cutoff(Utc.with_ymd_and_hms(2025, 6, 15, 9, 30, 0).unwrap()),
            at(2025, 5, 1)
        );
        assert_eq!(usage_cutoff(at(2025, 1, 1)), at(2024, 12, 1));
        assert_eq!(usage_cutoff(at(2025, 3, 31)), at(2025, 2, 1));
    }
}
