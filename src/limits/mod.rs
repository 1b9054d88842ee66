//! Admission control
//!
//! Checks run cheapest first and stop at the first failure:
//!
//! 1. concurrency slot (process-local)
//! 2. hourly requests (actor)
//! 3. daily tokens (actor)
//! 4. monthly tokens (organization)
//!
//! Windows 2-4 are aggregation queries over the usage store, so they stay
//! correct across instances. Checks compare recorded usage against the
//! limit; nothing is reserved for the request about to run.

mod concurrency;
pub mod window;

pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit, DEFAULT_MAX_CONCURRENT};

use crate::clock::Clock;
use crate::directory::{Actor, Organization, SubscriptionTier};
use crate::error::{AppError, AppResult};
use crate::ids::ActorId;
use crate::store::UsageStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const DEFAULT_READ_ONLY_HOURLY_LIMIT: u64 = 120;

/// Which quota rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    #[serde(rename = "concurrency_limit")]
    Concurrency,
    #[serde(rename = "hourly_request_limit")]
    HourlyRequests,
    #[serde(rename = "daily_token_limit")]
    DailyTokens,
    #[serde(rename = "monthly_token_limit")]
    MonthlyTokens,
    #[serde(rename = "read_only_request_limit")]
    ReadOnlyRequests,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Concurrency => "concurrency_limit",
            LimitKind::HourlyRequests => "hourly_request_limit",
            LimitKind::DailyTokens => "daily_token_limit",
            LimitKind::MonthlyTokens => "monthly_token_limit",
            LimitKind::ReadOnlyRequests => "read_only_request_limit",
        }
    }
}

/// Result of one quota check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LimitKind>,
    pub current: u64,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    pub fn allowed(current: u64, limit: u64, reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: true,
            reason: None,
            current,
            limit,
            reset_at,
            retry_after_seconds: None,
        }
    }

    pub fn denied(
        kind: LimitKind,
        current: u64,
        limit: u64,
        reset_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let retry_after_seconds = reset_at.map(|at| {
            let millis = (at - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000).max(1)
        });
        Self {
            allowed: false,
            reason: Some(kind),
            current,
            limit,
            reset_at,
            retry_after_seconds,
        }
    }

    /// Human-readable explanation with retry guidance
    pub fn user_message(&self) -> String {
        let wait = self
            .retry_after_seconds
            .map(countdown)
            .unwrap_or_else(|| "a little while".to_string());
        match self.reason {
            None => "Request allowed".to_string(),
            Some(LimitKind::Concurrency) => format!(
                "You already have {} AI requests in progress. Please wait for one to finish and try again.",
                self.current
            ),
            Some(LimitKind::HourlyRequests) | Some(LimitKind::ReadOnlyRequests) => format!(
                "You have reached your hourly limit of {} AI requests. Please try again in {}.",
                self.limit, wait
            ),
            Some(LimitKind::DailyTokens) => format!(
                "You have used your daily AI allowance of {} tokens. Please try again in {}.",
                self.limit, wait
            ),
            Some(LimitKind::MonthlyTokens) => "Your organization has reached its monthly AI budget. \
                 Please contact your administrator to raise the limit."
                .to_string(),
        }
    }
}

fn countdown(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{} second{}", seconds, if seconds == 1 { "" } else { "s" });
    }
    let minutes = seconds.div_ceil(60);
    if minutes < 60 {
        return format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" });
    }
    let hours = minutes / 60;
    let rest = minutes % 60;
    if rest == 0 {
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else {
        format!("{}h {}m", hours, rest)
    }
}

/// Quota sizes for one subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub hourly_requests: u64,
    pub daily_tokens: u64,
    pub monthly_tokens: u64,
}

impl TierLimits {
    pub const FREE: TierLimits = TierLimits {
        hourly_requests: 30,
        daily_tokens: 10_000,
        monthly_tokens: 100_000,
    };

    pub const PLUS: TierLimits = TierLimits {
        hourly_requests: 100,
        daily_tokens: 50_000,
        monthly_tokens: 500_000,
    };
}

/// Deployment-wide caps; each one beats every tier default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub hourly_requests: Option<u64>,
    pub daily_tokens: Option<u64>,
    pub monthly_tokens: Option<u64>,
}

/// Fully resolved limiter settings
#[derive(Debug, Clone, PartialEq)]
pub struct LimitPolicy {
    pub max_concurrent: u32,
    pub read_only_hourly: u64,
    pub free: TierLimits,
    pub plus: TierLimits,
    pub overrides: LimitOverrides,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            read_only_hourly: DEFAULT_READ_ONLY_HOURLY_LIMIT,
            free: TierLimits::FREE,
            plus: TierLimits::PLUS,
            overrides: LimitOverrides::default(),
        }
    }
}

impl LimitPolicy {
    fn tier(&self, tier: SubscriptionTier) -> &TierLimits {
        match tier {
            SubscriptionTier::Free => &self.free,
            SubscriptionTier::Plus => &self.plus,
        }
    }

    pub fn hourly_requests(&self, tier: SubscriptionTier) -> u64 {
        self.overrides
            .hourly_requests
            .unwrap_or(self.tier(tier).hourly_requests)
    }

    pub fn daily_tokens(&self, tier: SubscriptionTier) -> u64 {
        self.overrides
            .daily_tokens
            .unwrap_or(self.tier(tier).daily_tokens)
    }

    /// Organization budget, then deployment cap, then tier default
    pub fn monthly_tokens(&self, org: &Organization) -> u64 {
        org.monthly_token_budget
            .or(self.overrides.monthly_tokens)
            .unwrap_or(self.tier(org.tier).monthly_tokens)
    }
}

/// Process-local hourly counter for endpoints with no LLM cost
#[derive(Debug, Default)]
struct ReadOnlyCounter {
    windows: Mutex<HashMap<ActorId, (DateTime<Utc>, u64)>>,
}

impl ReadOnlyCounter {
    /// Count the request if under `limit`; returns the count before this request
    fn hit(&self, actor: &ActorId, window: DateTime<Utc>, limit: u64) -> Result<u64, u64> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|_, (start, _)| *start >= window);
        let (_, count) = windows.entry(actor.clone()).or_insert((window, 0));
        if *count >= limit {
            return Err(*count);
        }
        *count += 1;
        Ok(*count - 1)
    }
}

/// Every window for one caller, without enforcing any of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOverview {
    pub concurrent_requests: u64,
    pub concurrent_limit: u64,
    pub hourly_requests: RateLimitResult,
    pub daily_tokens: RateLimitResult,
    pub monthly_tokens: RateLimitResult,
}

pub struct RateLimiter {
    usage: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    policy: LimitPolicy,
    concurrency: ConcurrencyLimiter,
    read_only: ReadOnlyCounter,
}

impl RateLimiter {
    pub fn new(usage: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, policy: LimitPolicy) -> Self {
        let concurrency = ConcurrencyLimiter::new(policy.max_concurrent);
        Self {
            usage,
            clock,
            policy,
            concurrency,
            read_only: ReadOnlyCounter::default(),
        }
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    pub fn monthly_limit_for(&self, org: &Organization) -> u64 {
        self.policy.monthly_tokens(org)
    }

    pub fn try_acquire_slot(&self, actor: &ActorId) -> Result<ConcurrencyPermit, RateLimitResult> {
        self.concurrency.try_acquire(actor).map_err(|current| {
            RateLimitResult::denied(
                LimitKind::Concurrency,
                current as u64,
                self.concurrency.max() as u64,
                None,
                self.clock.now(),
            )
        })
    }

    pub async fn check_hourly_requests(
        &self,
        actor: &ActorId,
        tier: SubscriptionTier,
    ) -> AppResult<RateLimitResult> {
        let now = self.clock.now();
        let current = self
            .usage
            .count_actor_calls_since(actor, window::hour_start(now))
            .await?;
        Ok(evaluate(
            LimitKind::HourlyRequests,
            current,
            self.policy.hourly_requests(tier),
            window::next_hour(now),
            now,
        ))
    }

    pub async fn check_daily_tokens(
        &self,
        actor: &ActorId,
        tier: SubscriptionTier,
    ) -> AppResult<RateLimitResult> {
        let now = self.clock.now();
        let current = self
            .usage
            .sum_actor_tokens_since(actor, window::day_start(now))
            .await?;
        Ok(evaluate(
            LimitKind::DailyTokens,
            current,
            self.policy.daily_tokens(tier),
            window::next_day(now),
            now,
        ))
    }

    pub async fn check_monthly_tokens(&self, org: &Organization) -> AppResult<RateLimitResult> {
        let now = self.clock.now();
        let current = self
            .usage
            .sum_org_tokens_since(&org.id, window::month_start(now))
            .await?;
        Ok(evaluate(
            LimitKind::MonthlyTokens,
            current,
            self.monthly_limit_for(org),
            window::next_month(now),
            now,
        ))
    }

    /// Counts one read-only request against the separate hourly budget
    pub fn check_read_only(&self, actor: &ActorId) -> RateLimitResult {
        let now = self.clock.now();
        let limit = self.policy.read_only_hourly;
        let reset_at = window::next_hour(now);
        match self.read_only.hit(actor, window::hour_start(now), limit) {
            Ok(current) => RateLimitResult::allowed(current, limit, Some(reset_at)),
            Err(current) => RateLimitResult::denied(
                LimitKind::ReadOnlyRequests,
                current,
                limit,
                Some(reset_at),
                now,
            ),
        }
    }

    /// Run the full admission chain for a chat request
    ///
    /// The returned permit holds the concurrency slot; it is released on
    /// every rejection path before this returns.
    pub async fn admit(&self, actor: &Actor, org: &Organization) -> AppResult<ConcurrencyPermit> {
        let permit = self
            .try_acquire_slot(&actor.id)
            .map_err(|denied| AppError::RateLimited(Box::new(denied)))?;

        let hourly = self.check_hourly_requests(&actor.id, org.tier).await?;
        reject_unless_allowed(hourly)?;

        let daily = self.check_daily_tokens(&actor.id, org.tier).await?;
        reject_unless_allowed(daily)?;

        let monthly = self.check_monthly_tokens(org).await?;
        reject_unless_allowed(monthly)?;

        Ok(permit)
    }

    pub async fn usage_overview(
        &self,
        actor: &Actor,
        org: &Organization,
    ) -> AppResult<UsageOverview> {
        Ok(UsageOverview {
            concurrent_requests: self.concurrency.in_flight(&actor.id) as u64,
            concurrent_limit: self.concurrency.max() as u64,
            hourly_requests: self.check_hourly_requests(&actor.id, org.tier).await?,
            daily_tokens: self.check_daily_tokens(&actor.id, org.tier).await?,
            monthly_tokens: self.check_monthly_tokens(org).await?,
        })
    }
}

fn evaluate(
    kind: LimitKind,
    current: u64,
    limit: u64,
    reset_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RateLimitResult {
    if current >= limit {
        RateLimitResult::denied(kind, current, limit, Some(reset_at), now)
    } else {
        RateLimitResult::allowed(current, limit, Some(reset_at))
    }
}

fn reject_unless_allowed(result: RateLimitResult) -> AppResult<()> {
    if result.allowed {
        Ok(())
    } else {
        Err(AppError::RateLimited(Box::new(result)))
    }
}
