use std::sync::Arc;

use charforge::{
    config::AppConfig,
    db::{
        self,
        store::{CurationStore, LedgerStore, PgStore},
    },
    models::curation::{CurationDecision, CurationStatus, SourceImage},
    models::job::{DailyCreditGrant, Job, JobOptions, JobPayload, JobProgress, JobState},
    services::{
        credits::{CreditLedger, GuardError},
        queue::{QueueBackend, RedisQueueBackend},
    },
};
use chrono::Utc;
use uuid::Uuid;

async fn store(config: &AppConfig) -> Arc<PgStore> {
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(PgStore::new(pool))
}

/// Integration test: credit ledger on PostgreSQL
///
/// Verifies against a real database:
/// 1. Initial grant is written once
/// 2. A failed operation is debited and refunded
/// 3. Concurrent debits never overdraw the balance
///
/// Note: This requires a running PostgreSQL instance configured via
/// environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_ledger_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let store = store(&config).await;
    let ledger = CreditLedger::new(store.clone());
    let user = Uuid::new_v4();

    assert!(ledger.grant_initial(user, 100).await.expect("Grant failed"));
    assert!(!ledger.grant_initial(user, 100).await.expect("Grant failed"));
    assert_eq!(ledger.balance(user).await.unwrap(), 100);

    let failed = ledger
        .with_credits(user, 40, "integration failure", || async { Err::<(), _>("boom") })
        .await;
    assert!(matches!(failed, Err(GuardError::Operation("boom"))));
    assert_eq!(ledger.balance(user).await.unwrap(), 100);

    let (a, b) = tokio::join!(
        store.debit(user, 60, "concurrent a", false),
        store.debit(user, 60, "concurrent b", false)
    );
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one concurrent debit may succeed"
    );
    assert_eq!(ledger.balance(user).await.unwrap(), 40);

    let transactions = store.transactions(user).await.unwrap();
    assert!(transactions.iter().any(|t| t.reason == "refund: integration failure"));

    println!("✓ Ledger integration passed");
}

/// Integration test: curated image claims on PostgreSQL
///
/// Two concurrent claims for the same approved item must hand it out once,
/// and a completed item cannot be linked a second time.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_curation_claims_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let store = store(&config).await;

    let candidate = SourceImage {
        source_id: format!("it-{}", Uuid::new_v4()),
        url: format!("https://image.example.com/it/{}.jpeg", Uuid::new_v4()),
        width: Some(832),
        height: Some(1216),
        author: None,
        reactions: 0,
    };
    let inserted = store
        .insert_candidates(std::slice::from_ref(&candidate))
        .await
        .expect("Insert failed");
    assert_eq!(inserted.len(), 1);
    assert!(store
        .insert_candidates(std::slice::from_ref(&candidate))
        .await
        .unwrap()
        .is_empty());

    let item = store
        .record_decision(
            inserted[0].id,
            &CurationDecision {
                status: CurationStatus::Approved,
                quality_score: 8.5,
                gender: Some("female".to_string()),
                species: Some("elf".to_string()),
                rejection_reason: None,
            },
        )
        .await
        .expect("Decision failed");
    assert!(item.approved_at.is_some());

    let ids = [item.id];
    let (a, b) = tokio::join!(
        store.claim_approved(1, Some(&ids)),
        store.claim_approved(1, Some(&ids))
    );
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);

    store.release_claim(item.id).await.expect("Release failed");
    let reclaimed = store.claim_approved(1, Some(&ids)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);

    println!("✓ Curation claim integration passed");
}

/// Integration test: Redis queue backend
///
/// Verifies job storage, priority order, progress, completion and the
/// schedule fire claim.
///
/// Note: This requires a running Redis instance configured via environment
/// variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_redis_queue_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let prefix = format!("it-{}", Uuid::new_v4());
    let backend = RedisQueueBackend::connect(&config.redis_url, &prefix)
        .await
        .expect("Failed to connect to Redis");
    backend.ping().await.expect("Redis ping failed");

    let queue = "integration";
    let payload = |amount| JobPayload::DailyCreditGrant(DailyCreditGrant { amount: Some(amount) });
    let low = Job::new(queue, payload(1), JobOptions::default());
    let high = Job::new(
        queue,
        payload(2),
        JobOptions {
            priority: 5,
            ..JobOptions::default()
        },
    );
    backend.push(&low).await.unwrap();
    backend.push(&high).await.unwrap();
    assert_eq!(backend.counts(queue).await.unwrap().waiting, 2);

    let first = backend.pop(queue).await.unwrap().expect("Expected a job");
    assert_eq!(first.id, high.id);
    assert_eq!(first.state, JobState::Active);

    backend
        .set_progress(queue, first.id, &JobProgress::Percent { value: 40 })
        .await
        .unwrap();
    let stored = backend.get_job(queue, first.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, Some(JobProgress::Percent { value: 40 }));

    backend
        .complete(queue, first.id, Some(serde_json::json!({ "ok": true })), false)
        .await
        .unwrap();
    let counts = backend.counts(queue).await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.completed), (1, 0, 1));

    let fire_at = Utc::now();
    assert!(backend.claim_fire("it-schedule", fire_at).await.unwrap());
    assert!(!backend.claim_fire("it-schedule", fire_at).await.unwrap());
    backend.release_fire("it-schedule", fire_at).await.unwrap();
    assert!(backend.claim_fire("it-schedule", fire_at).await.unwrap());

    assert!(backend.remove_job(queue, low.id).await.unwrap());
    assert!(backend.remove_job(queue, first.id).await.unwrap());

    println!("✓ Redis queue integration passed");
}
