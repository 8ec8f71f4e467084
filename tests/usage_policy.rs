use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::future::join_all;
use metered_gateway::billing::{
    Admission, BillingStore, CreditLedger, DenialReason, MemoryBillingStore, MemoryCounterStore,
    Plan, RateLimiter, UsageDecision, UsagePolicyEngine,
};
use uuid::Uuid;

fn engine(daily_limit: u64) -> (UsagePolicyEngine, Arc<MemoryBillingStore>) {
    let store = Arc::new(MemoryBillingStore::new());
    let limiter = RateLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        daily_limit,
        Duration::from_secs(86_400),
        "policy:free",
    );
    (
        UsagePolicyEngine::new(limiter, CreditLedger::new(store.clone())),
        store,
    )
}

#[tokio::test]
async fn free_account_gets_exactly_the_daily_limit() {
    let (engine, _) = engine(3);
    let account_id = Uuid::new_v4();

    for expected_remaining in [2, 1, 0] {
        assert_eq!(
            engine.check_usage(account_id, Plan::Free).await.unwrap(),
            UsageDecision::Allowed {
                remaining: Some(expected_remaining)
            }
        );
    }

    let denied = engine.check_usage(account_id, Plan::Free).await.unwrap();
    let UsageDecision::Denied(reason) = denied else {
        panic!("fourth request should be denied, got {denied:?}");
    };
    assert_eq!(reason, DenialReason::DailyLimitReached);
    assert!(reason.to_string().to_lowercase().contains("limite"));

    // another account has its own window
    assert!(engine
        .check_usage(Uuid::new_v4(), Plan::Free)
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn free_quota_rolls_over_at_the_window_boundary() {
    let limiter = RateLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        3,
        Duration::from_secs(86_400),
        "policy:free",
    );
    let account_id = Uuid::new_v4();
    let late = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
    let next_day = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 1).unwrap();

    for _ in 0..3 {
        assert!(limiter.consume_at(account_id, late).await.allowed);
    }
    let denied = limiter.consume_at(account_id, late).await;
    assert!(!denied.allowed);
    assert_eq!(denied.reset_at, Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap());

    let fresh = limiter.consume_at(account_id, next_day).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 2);
}

#[tokio::test]
async fn check_then_record_can_admit_two_requests_on_the_last_credit() {
    let (engine, store) = engine(20);
    let account_id = Uuid::new_v4();
    store.insert_account(account_id, "last@example.com", "credits", 1);

    let first = engine.check_usage(account_id, Plan::Credits).await.unwrap();
    let second = engine.check_usage(account_id, Plan::Credits).await.unwrap();
    assert!(first.is_allowed());
    assert!(second.is_allowed());

    engine.record_usage(account_id, Plan::Credits).await.unwrap();
    engine.record_usage(account_id, Plan::Credits).await.unwrap();
    assert_eq!(store.balance(account_id).await.unwrap(), 0);
    // the floor only removed the one credit that existed
    assert_eq!(store.ledger_snapshot(account_id).len(), 1);
}

#[tokio::test]
async fn admit_hands_the_last_credit_to_exactly_one_request() {
    let (engine, store) = engine(20);
    let account_id = Uuid::new_v4();
    store.insert_account(account_id, "last@example.com", "credits", 1);

    let (first, second) = tokio::join!(
        engine.admit(account_id, Plan::Credits),
        engine.admit(account_id, Plan::Credits)
    );
    let admissions = [first.unwrap(), second.unwrap()];
    let granted = admissions
        .iter()
        .filter(|admission| matches!(admission, Admission::Granted(_)))
        .count();
    assert_eq!(granted, 1);
    assert!(admissions
        .iter()
        .any(|admission| *admission == Admission::Denied(DenialReason::InsufficientCredits)));
    assert_eq!(store.balance(account_id).await.unwrap(), 0);
}

#[tokio::test]
async fn many_concurrent_admissions_never_overdraw() {
    let (engine, store) = engine(20);
    let account_id = Uuid::new_v4();
    store.insert_account(account_id, "burst@example.com", "credits", 5);

    let attempts = (0..20).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.admit(account_id, Plan::Credits).await })
    });
    let granted = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|admission| matches!(admission, Admission::Granted(_)))
        .count();
    assert_eq!(granted, 5);
    assert_eq!(store.balance(account_id).await.unwrap(), 0);
}

#[tokio::test]
async fn released_ticket_returns_the_reserved_credit() {
    let (engine, store) = engine(20);
    let account_id = Uuid::new_v4();
    store.insert_account(account_id, "refund@example.com", "credits", 2);

    let Admission::Granted(ticket) = engine.admit(account_id, Plan::Credits).await.unwrap() else {
        panic!("expected admission");
    };
    assert_eq!(ticket.remaining, Some(1));
    assert_eq!(ticket.reserved_credits(), 1);
    assert_eq!(store.balance(account_id).await.unwrap(), 1);

    engine.release(ticket).await.unwrap();
    assert_eq!(store.balance(account_id).await.unwrap(), 2);
}

#[tokio::test]
async fn unknown_plan_label_is_denied() {
    let (engine, _) = engine(20);
    let admission = engine
        .admit_account(Uuid::new_v4(), "enterprise")
        .await
        .unwrap();
    assert_eq!(admission, Admission::Denied(DenialReason::UnknownPlan));
}
