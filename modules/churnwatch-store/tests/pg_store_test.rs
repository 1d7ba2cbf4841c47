//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.
//!
//! Tests share one database, so they truncate on entry; run with
//! `--test-threads=1` against a real instance.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use churnwatch_common::{
    ActionRecord, ActivityLog, AggregateRecord, CustomerRegistration, ReasonCode, RiskClass,
    RiskScore, SupportCase, Transaction,
};
use churnwatch_store::{
    pg::insert_support_case, ActionStore, AggregateStore, ContextSource, CycleLock, PgStore,
    RawEventSink, WindowReader, MIGRATOR,
};

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    MIGRATOR.run(&pool).await.ok()?;

    sqlx::query(
        "TRUNCATE transactions, activity_logs, customers, customer_accounts, support_cases, \
         churn_aggregates, retention_actions, cycle_locks",
    )
    .execute(&pool)
    .await
    .ok()?;

    Some(pool)
}

fn txn(reference: &str, account: &str, day: u32, code: &str, amount: f64) -> Transaction {
    let at = Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap();
    Transaction {
        transaction_ref: reference.to_string(),
        account_id: account.to_string(),
        posting_date: at,
        transaction_code: code.to_string(),
        amount,
        merchant_description: Some("Corner Shop".to_string()),
        merchant_category_code: Some("5411".to_string()),
        channel_id: None,
        received_at: at,
    }
}

// =========================================================================
// Raw events
// =========================================================================

#[tokio::test]
async fn replayed_transactions_are_not_duplicated() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool);

    let batch = vec![
        txn("T1", "ACC-1", 1, "POS", 12.5),
        txn("T2", "ACC-1", 2, "WIRE_OUT", 6000.0),
    ];
    assert_eq!(store.write_transactions(&batch).await.unwrap(), 2);
    assert_eq!(store.write_transactions(&batch).await.unwrap(), 0);

    let from = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
    let snapshot = store.read_window(from, to).await.unwrap();
    assert_eq!(snapshot.transactions.len(), 2);
}

#[tokio::test]
async fn registrations_link_accounts_to_customers() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool);
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

    let registration = CustomerRegistration {
        customer_id: "C1".to_string(),
        full_name: Some("Ada Lovelace".to_string()),
        email: None,
        segment: Some("retail".to_string()),
        join_date: None,
        risk_profile_score: Some(0.2),
        account_ids: vec!["ACC-1".to_string(), "ACC-2".to_string()],
        received_at: at,
    };
    assert_eq!(store.write_registrations(&[registration]).await.unwrap(), 1);

    let snapshot = store
        .read_window(at, at + chrono::Duration::days(1))
        .await
        .unwrap();
    let mut links: Vec<(String, String)> = snapshot
        .account_links
        .into_iter()
        .map(|l| (l.account_id, l.customer_id))
        .collect();
    links.sort();
    assert_eq!(
        links,
        vec![
            ("ACC-1".to_string(), "C1".to_string()),
            ("ACC-2".to_string(), "C1".to_string()),
        ]
    );
}

#[tokio::test]
async fn window_excludes_upper_bound() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool);

    let at = |day| Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap();
    let log = |id: &str, day| ActivityLog {
        log_id: id.to_string(),
        customer_id: "C1".to_string(),
        event_type: Some("LOGIN".to_string()),
        event_timestamp: at(day),
        device_os: None,
        page_url: None,
        error_code: None,
        received_at: at(day),
    };
    store
        .write_activity_logs(&[log("L1", 1), log("L2", 2)])
        .await
        .unwrap();

    let snapshot = store.read_window(at(1), at(2)).await.unwrap();
    assert_eq!(snapshot.activity_logs.len(), 1);
    assert_eq!(snapshot.activity_logs[0].log_id, "L1");
}

// =========================================================================
// Aggregates, actions, locks, context
// =========================================================================

#[tokio::test]
async fn replace_aggregates_swaps_the_whole_set() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool);
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

    let record = |entity: &str, bp: u32, class: RiskClass| AggregateRecord {
        entity_id: entity.to_string(),
        window_start: at - chrono::Duration::days(30),
        window_end: at,
        txn_count: 3,
        total_spend: 120.0,
        wire_out_total: 0.0,
        error_count: 0,
        support_cases: 0,
        avg_sentiment: 0.5,
        active_days: 2,
        churn_score: RiskScore::from_basis_points(bp),
        risk_class: class,
        computed_at: at,
    };

    store
        .replace_aggregates(&[record("A", 2000, RiskClass::Low), record("B", 7500, RiskClass::High)])
        .await
        .unwrap();
    store
        .replace_aggregates(&[record("C", 4500, RiskClass::Medium)])
        .await
        .unwrap();

    let loaded = store.load_aggregates().await.unwrap();
    assert_eq!(loaded, vec![record("C", 4500, RiskClass::Medium)]);
}

#[tokio::test]
async fn second_action_in_same_bucket_is_rejected() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool);
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();

    let action = |minutes: i64| ActionRecord {
        id: Uuid::new_v4(),
        entity_id: "C1".to_string(),
        churn_score: 0.85,
        reason: ReasonCode::CriticalRiskDetected,
        generated_content: "We miss you".to_string(),
        created_at: at + chrono::Duration::minutes(minutes),
    };

    assert!(store.record_action(&action(0), 42).await.unwrap());
    assert!(!store.record_action(&action(5), 42).await.unwrap());
    assert_eq!(store.latest_action_at("C1").await.unwrap(), Some(at));
    assert_eq!(store.actions_for("C1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn cycle_lock_excludes_other_holders() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let first = PgStore::new(pool.clone());
    let second = PgStore::new(pool);
    let stale = Duration::from_secs(1800);

    assert!(first.acquire_cycle_lock(stale).await.unwrap());
    assert!(!second.acquire_cycle_lock(stale).await.unwrap());

    // Only the holder can release.
    second.release_cycle_lock().await.unwrap();
    assert!(!second.acquire_cycle_lock(stale).await.unwrap());

    first.release_cycle_lock().await.unwrap();
    assert!(second.acquire_cycle_lock(stale).await.unwrap());
}

#[tokio::test]
async fn context_returns_newest_transcripts_first() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgStore::new(pool.clone());

    for (id, day, transcript) in [("S1", 1, "first call"), ("S2", 5, "latest call")] {
        insert_support_case(
            &pool,
            &SupportCase {
                case_id: id.to_string(),
                customer_id: "C1".to_string(),
                opened_at: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
                channel: Some("phone".to_string()),
                category: None,
                sentiment_score: Some(0.2),
                transcript: Some(transcript.to_string()),
            },
        )
        .await
        .unwrap();
    }

    assert_eq!(
        store.context_for("C1").await.unwrap(),
        vec!["latest call", "first call"]
    );
}
