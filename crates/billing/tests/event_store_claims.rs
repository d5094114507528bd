//! Event store integration tests
//!
//! Exercise the dedup insert and the claim/release/stale predicates against
//! a real database. These are ignored by default; run them with a PostgreSQL
//! instance available:
//!
//!     DATABASE_URL=postgres://... cargo test -p vitrina-billing -- --ignored

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;
use vitrina_billing::{EventStore, IngestOutcome, NewWebhookEvent};

async fn test_store() -> (PgPool, EventStore) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for these tests");
    let pool = vitrina_shared::create_pool(&url).await.unwrap();
    vitrina_shared::run_migrations(&pool).await.unwrap();
    (pool.clone(), EventStore::new(pool))
}

fn new_event() -> NewWebhookEvent {
    NewWebhookEvent {
        // Unique per run so tests can share a database
        request_id: format!("test:{}", Uuid::new_v4()),
        event_type: "payment.updated".to_string(),
        mp_id: Some("123".to_string()),
        payload: serde_json::json!({"type": "payment", "data": {"id": 123}}),
    }
}

async fn ingest_one(store: &EventStore) -> Uuid {
    match store.ingest(new_event()).await.unwrap() {
        IngestOutcome::Accepted(id) => id,
        IngestOutcome::Duplicate => panic!("fresh request_id reported as duplicate"),
    }
}

/// Push an event's claim past the grace window, simulating a worker that
/// died holding it.
async fn expire_claim(pool: &PgPool, event_id: Uuid) {
    sqlx::query("UPDATE webhook_events SET claimed_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(event_id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn duplicate_request_id_inserts_exactly_one_row() {
    let (pool, store) = test_store().await;

    let event = new_event();
    let first = store.ingest(event.clone()).await.unwrap();
    let second = store.ingest(event.clone()).await.unwrap();

    assert!(matches!(first, IngestOutcome::Accepted(_)));
    assert_eq!(second, IngestOutcome::Duplicate);

    let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_events WHERE request_id = $1")
        .bind(&event.request_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows.0, 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn concurrent_claim_has_exactly_one_winner() {
    let (_pool, store) = test_store().await;
    let event_id = ingest_one(&store).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(
            async move { store.claim(event_id).await.unwrap() },
        ));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn fresh_claim_blocks_reclaim_until_released() {
    let (_pool, store) = test_store().await;
    let event_id = ingest_one(&store).await;

    assert!(store.claim(event_id).await.unwrap());
    assert!(!store.claim(event_id).await.unwrap());

    // Pre-commit failure path: release, then the event is claimable again
    // and still unprocessed.
    store.release(event_id).await.unwrap();
    let event = store.fetch(event_id).await.unwrap().unwrap();
    assert!(!event.processed);
    assert!(store.claim(event_id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn abandoned_claim_is_reclaimable_after_grace() {
    let (pool, store) = test_store().await;
    let event_id = ingest_one(&store).await;

    assert!(store.claim(event_id).await.unwrap());
    expire_claim(&pool, event_id).await;

    // The sweep's scan surfaces the orphaned event...
    let stale = store
        .stale_unprocessed(Duration::seconds(0), 1000)
        .await
        .unwrap();
    assert!(stale.iter().any(|e| e.id == event_id));

    // ...and re-claiming it succeeds.
    assert!(store.claim(event_id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn processed_event_is_never_reclaimed() {
    let (pool, store) = test_store().await;
    let event_id = ingest_one(&store).await;

    assert!(store.claim(event_id).await.unwrap());
    let mut tx = pool.begin().await.unwrap();
    store.mark_processed(&mut tx, event_id).await.unwrap();
    tx.commit().await.unwrap();

    let event = store.fetch(event_id).await.unwrap().unwrap();
    assert!(event.processed);
    assert!(event.processed_at.is_some());

    // Processed rows are invisible to both the claim and the sweep,
    // even with an expired claim timestamp.
    expire_claim(&pool, event_id).await;
    assert!(!store.claim(event_id).await.unwrap());
    let stale = store
        .stale_unprocessed(Duration::seconds(0), 1000)
        .await
        .unwrap();
    assert!(stale.iter().all(|e| e.id != event_id));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn uncommitted_attempt_leaves_no_state_behind() {
    let (pool, store) = test_store().await;
    let event_id = ingest_one(&store).await;

    assert!(store.claim(event_id).await.unwrap());

    // Worker dies mid-transaction: mark_processed rolls back with the tx.
    let mut tx = pool.begin().await.unwrap();
    store.mark_processed(&mut tx, event_id).await.unwrap();
    drop(tx);

    let event = store.fetch(event_id).await.unwrap().unwrap();
    assert!(!event.processed);
    assert!(event.processed_at.is_none());

    // After the grace window the sweep retries it from scratch.
    expire_claim(&pool, event_id).await;
    assert!(store.claim(event_id).await.unwrap());
}
