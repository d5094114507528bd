//! Webhook event store
//!
//! Durable table of inbound deliveries, keyed by the provider's idempotency
//! token (`request_id`). Rows are inserted unprocessed by the receiver,
//! claimed and marked processed by the event processor, and never deleted
//! (audit trail). The unique index on `request_id` is the first
//! deduplication barrier; the claim column is the second.

use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// How long a claim may be held before the sweep considers the worker dead
/// and the event re-claimable.
pub const CLAIM_GRACE: Duration = Duration::minutes(5);

/// One row of the webhook_events table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub request_id: String,
    pub event_type: String,
    pub mp_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub processed: bool,
    pub processed_at: Option<OffsetDateTime>,
    pub claimed_at: Option<OffsetDateTime>,
}

/// Fields for a new, not-yet-persisted delivery.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub request_id: String,
    pub event_type: String,
    pub mp_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Result of attempting to persist a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sight of this request_id; a row was created.
    Accepted(Uuid),
    /// A row with this request_id already exists. No-op success.
    Duplicate,
}

/// Durable store of webhook deliveries.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-if-absent by request_id.
    ///
    /// A second delivery with the same request_id must not create a second
    /// row; `ON CONFLICT DO NOTHING` makes the duplicate path a no-op at the
    /// database, not a racy check-then-insert.
    pub async fn ingest(&self, event: NewWebhookEvent) -> BillingResult<IngestOutcome> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, request_id, event_type, mp_id, payload, created_at, processed)
            VALUES ($1, $2, $3, $4, $5, NOW(), FALSE)
            ON CONFLICT (request_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.request_id)
        .bind(&event.event_type)
        .bind(event.mp_id.as_ref())
        .bind(&event.payload)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some((id,)) => {
                tracing::info!(
                    request_id = %event.request_id,
                    event_type = %event.event_type,
                    mp_id = ?event.mp_id,
                    event_id = %id,
                    "Webhook event stored"
                );
                Ok(IngestOutcome::Accepted(id))
            }
            None => {
                tracing::info!(
                    request_id = %event.request_id,
                    event_type = %event.event_type,
                    "Duplicate webhook delivery, row already exists"
                );
                Ok(IngestOutcome::Duplicate)
            }
        }
    }

    /// Atomically claim an unprocessed event for exclusive processing.
    ///
    /// Succeeds for unclaimed events and for events whose previous claim is
    /// older than [`CLAIM_GRACE`] (worker crashed mid-flight). Exactly one of
    /// any number of concurrent callers wins.
    pub async fn claim(&self, event_id: Uuid) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET claimed_at = NOW()
            WHERE id = $1
              AND processed = FALSE
              AND (claimed_at IS NULL OR claimed_at < NOW() - $2::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(format!("{} seconds", CLAIM_GRACE.whole_seconds()))
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Release a claim after a pre-commit failure so the sweep or the next
    /// delivery retry can re-attempt from scratch.
    pub async fn release(&self, event_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET claimed_at = NULL WHERE id = $1 AND processed = FALSE",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark the event processed inside the caller's commit transaction.
    ///
    /// This is the only place `processed` flips to true, and it flips exactly
    /// once: the transaction also carries the payment/business writes, so all
    /// effects become visible together or not at all.
    pub async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE, processed_at = NOW()
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(event_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn fetch(&self, event_id: Uuid) -> BillingResult<Option<WebhookEventRecord>> {
        let event: Option<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, request_id, event_type, mp_id, payload,
                   created_at, processed, processed_at, claimed_at
            FROM webhook_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    /// Events stuck unprocessed past the grace window, oldest first.
    ///
    /// Includes events with an expired claim: the claim predicate in
    /// [`claim`](Self::claim) makes re-claiming them safe.
    pub async fn stale_unprocessed(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, request_id, event_type, mp_id, payload,
                   created_at, processed, processed_at, claimed_at
            FROM webhook_events
            WHERE processed = FALSE
              AND created_at < NOW() - $1::INTERVAL
              AND (claimed_at IS NULL OR claimed_at < NOW() - $2::INTERVAL)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(format!("{} seconds", older_than.whole_seconds()))
        .bind(format!("{} seconds", CLAIM_GRACE.whole_seconds()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
