//! Admission control through the assistant pipeline

mod common;

use aigate::chat::ChatRequest;
use aigate::directory::SubscriptionTier;
use aigate::error::AppError;
use aigate::limits::{LimitKind, LimitOverrides, LimitPolicy, RateLimitResult};
use chrono::{TimeDelta, TimeZone, Utc};
use common::*;

fn rejection(err: AppError) -> RateLimitResult {
    match err {
        AppError::RateLimited(result) => *result,
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

fn with_policy(policy: LimitPolicy) -> Harness {
    Harness::with(HarnessOptions {
        policy,
        ..HarnessOptions::default()
    })
}

#[tokio::test]
async fn test_hourly_request_limit_rejects_before_any_spend() {
    let h = with_policy(LimitPolicy {
        overrides: LimitOverrides {
            hourly_requests: Some(2),
            ..LimitOverrides::default()
        },
        ..LimitPolicy::default()
    });
    h.spend(MEMBER, ORG, 10).await;
    h.spend(MEMBER, ORG, 10).await;

    let err = h
        .assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "hourly_request_limit");
    let result = rejection(err);
    assert!(!result.allowed);
    assert_eq!(result.current, 2);
    assert_eq!(result.limit, 2);
    assert_eq!(
        result.reset_at,
        Some(Utc.with_ymd_and_hms(2026, 3, 14, 11, 0, 0).unwrap())
    );
    assert_eq!(result.retry_after_seconds, Some(1800));
    assert_eq!(h.provider.calls(), 0);
    assert!(h.store.audit_entries().await.is_empty());
}

#[tokio::test]
async fn test_hourly_window_resets_on_the_hour() {
    let h = with_policy(LimitPolicy {
        overrides: LimitOverrides {
            hourly_requests: Some(1),
            ..LimitOverrides::default()
        },
        ..LimitPolicy::default()
    });
    h.spend(MEMBER, ORG, 10).await;
    assert!(
        h.assistant
            .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
            .await
            .is_err()
    );

    h.clock
        .set(Utc.with_ymd_and_hms(2026, 3, 14, 11, 0, 0).unwrap());
    h.provider.push_completion(completion("Back again.", 10, 2));
    h.assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_daily_tokens_follow_the_subscription_tier() {
    let h = Harness::new();
    // Free tier allows 10k tokens per actor per day
    h.spend(MEMBER, ORG, 10_000).await;

    let err = h
        .assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap_err();
    let result = rejection(err);
    assert_eq!(result.reason, Some(LimitKind::DailyTokens));
    assert_eq!(
        result.limit,
        LimitPolicy::default().daily_tokens(SubscriptionTier::Free)
    );
    assert_eq!(result.retry_after_seconds, Some(48_600));

    // Other actors in the same org keep their own daily window
    h.provider.push_completion(completion("Hello.", 10, 2));
    h.assistant
        .chat(caller(ADMIN, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap();

    // Midnight UTC re-opens the window
    h.clock.advance(TimeDelta::hours(14));
    h.provider.push_completion(completion("New day.", 10, 2));
    h.assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_custom_org_budget_beats_tier_and_deployment_caps() {
    let mut org = organization(ORG, SubscriptionTier::Plus);
    org.monthly_token_budget = Some(1_000);
    let h = Harness::with(HarnessOptions {
        organizations: vec![org],
        policy: LimitPolicy {
            overrides: LimitOverrides {
                monthly_tokens: Some(1_000_000),
                ..LimitOverrides::default()
            },
            ..LimitPolicy::default()
        },
        ..HarnessOptions::default()
    });
    h.spend(ADMIN, ORG, 1_000).await;

    let err = h
        .assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "monthly_token_limit");
    let result = rejection(err);
    assert_eq!(result.limit, 1_000);
    assert_eq!(
        result.reset_at,
        Some(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_concurrency_slot_is_held_by_an_open_stream() {
    let h = with_policy(LimitPolicy {
        max_concurrent: 1,
        ..LimitPolicy::default()
    });
    h.provider.push_completion(completion("Streaming.", 10, 2));

    let stream = h
        .assistant
        .clone()
        .chat_stream(caller(MEMBER, ORG), ChatRequest::new("first", None))
        .await
        .unwrap();

    let err = h
        .assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("second", None))
        .await
        .unwrap_err();
    let result = rejection(err);
    assert_eq!(result.reason, Some(LimitKind::Concurrency));
    assert_eq!(result.retry_after_seconds, None);

    // A different actor is unaffected
    h.provider.push_completion(completion("Other.", 10, 2));
    h.assistant
        .chat(caller(ADMIN, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap();

    drop(stream);
    let overview = h.assistant.usage(&caller(MEMBER, ORG)).await.unwrap();
    assert_eq!(overview.concurrent_requests, 0);
}

#[tokio::test]
async fn test_rejected_requests_release_their_slot() {
    let h = with_policy(LimitPolicy {
        max_concurrent: 1,
        ..LimitPolicy::default()
    });
    h.spend(MEMBER, ORG, 10_000).await;

    for _ in 0..3 {
        let err = h
            .assistant
            .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
            .await
            .unwrap_err();
        // Always the daily limit, never a leaked concurrency slot
        assert_eq!(rejection(err).reason, Some(LimitKind::DailyTokens));
    }
}

#[tokio::test]
async fn test_read_only_endpoints_have_their_own_budget() {
    let h = with_policy(LimitPolicy {
        read_only_hourly: 2,
        ..LimitPolicy::default()
    });

    h.assistant.usage(&caller(MEMBER, ORG)).await.unwrap();
    h.assistant
        .budget_status(&caller(MEMBER, ORG))
        .await
        .unwrap();
    let err = h
        .assistant
        .conversations(&caller(MEMBER, ORG))
        .await
        .unwrap_err();
    assert_eq!(rejection(err).reason, Some(LimitKind::ReadOnlyRequests));

    // Chat admission is untouched by read-only traffic
    h.provider.push_completion(completion("Still fine.", 10, 2));
    h.assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_usage_overview_reports_every_window() {
    let h = Harness::new();
    h.spend(MEMBER, ORG, 2_500).await;
    h.spend(ADMIN, ORG, 500).await;

    let overview = h.assistant.usage(&caller(MEMBER, ORG)).await.unwrap();
    assert_eq!(overview.hourly_requests.current, 1);
    assert_eq!(overview.daily_tokens.current, 2_500);
    assert_eq!(overview.monthly_tokens.current, 3_000);
    assert!(overview.daily_tokens.allowed);
    assert_eq!(overview.concurrent_limit, 3);
}

#[tokio::test]
async fn test_rate_limit_rejections_are_counted() {
    let h = Harness::new();
    h.spend(MEMBER, ORG, 10_000).await;
    let _ = h
        .assistant
        .chat(caller(MEMBER, ORG), ChatRequest::new("hi", None))
        .await;

    let output = h.metrics.gather().unwrap();
    assert!(output.contains("aigate_rate_limit_rejections_total"));
    assert!(output.contains(r#"outcome="rate_limited""#));
}
