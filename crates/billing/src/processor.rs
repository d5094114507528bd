//! Event processor
//!
//! Converts one unprocessed webhook event into authoritative Payment and
//! Business state, exactly once per request_id, regardless of concurrent or
//! repeated invocation:
//!
//! 1. claim the event (atomic, exactly one winner)
//! 2. resolve the payment (fetch authoritative status from the provider if
//!    the payload doesn't embed it)
//! 3. reconcile provider status against the ledger ("most terminal wins")
//! 4. drive the subscription transition on terminal statuses
//! 5. commit event + payment + business writes in one transaction
//!
//! Any failure before commit releases the claim so the sweep or the next
//! delivery retry re-attempts from step 1. No partial subscription mutation
//! is ever left visible.

use sqlx::PgPool;
use uuid::Uuid;
use vitrina_shared::Plan;

use crate::client::{MercadoPagoClient, ProviderPayment};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventStore, WebhookEventRecord};
use crate::payments::{merge_decision, MergeDecision, PaymentLedger, ProviderStatus};
use crate::subscriptions::{SubscriptionService, SubscriptionSignal};

/// Result of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Effects were applied and the event is committed as processed.
    Applied,
    /// Another worker holds or already completed this event.
    AlreadyHandled,
    /// The event was committed as processed but changed nothing (duplicate
    /// status, stale conflict, or an event the pipeline cannot act on).
    NoEffect,
    /// Transient failure (provider or store); claim released, the sweep will
    /// retry.
    Deferred,
}

/// Drives webhook events through the payment/subscription state machine.
#[derive(Debug, Clone)]
pub struct EventProcessor {
    pool: PgPool,
    store: EventStore,
    ledger: PaymentLedger,
    subscriptions: SubscriptionService,
    client: MercadoPagoClient,
}

impl EventProcessor {
    pub fn new(pool: PgPool, client: MercadoPagoClient) -> Self {
        Self {
            store: EventStore::new(pool.clone()),
            ledger: PaymentLedger,
            subscriptions: SubscriptionService,
            client,
            pool,
        }
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// Process one event by id. Safe to call concurrently and repeatedly.
    pub async fn process_by_id(&self, event_id: Uuid) -> BillingResult<ProcessOutcome> {
        let Some(event) = self.store.fetch(event_id).await? else {
            return Err(BillingError::Internal(format!(
                "webhook event {} does not exist",
                event_id
            )));
        };
        self.process(&event).await
    }

    /// Process one event. Claims first; releases the claim on any failure
    /// before commit.
    pub async fn process(&self, event: &WebhookEventRecord) -> BillingResult<ProcessOutcome> {
        if event.processed {
            return Ok(ProcessOutcome::AlreadyHandled);
        }

        // Step 1: claim. Exactly one concurrent worker gets past this line.
        if !self.store.claim(event.id).await? {
            tracing::debug!(
                event_id = %event.id,
                request_id = %event.request_id,
                "Event already claimed or processed"
            );
            return Ok(ProcessOutcome::AlreadyHandled);
        }

        match self.process_claimed(event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    event_id = %event.id,
                    request_id = %event.request_id,
                    error = %e,
                    "Transient failure, releasing claim for retry"
                );
                self.store.release(event.id).await?;
                Ok(ProcessOutcome::Deferred)
            }
            Err(e) => {
                // Hard failure: release so the sweep keeps retrying and the
                // stuck event stays visible instead of silently swallowed.
                self.store.release(event.id).await?;
                Err(e)
            }
        }
    }

    async fn process_claimed(&self, event: &WebhookEventRecord) -> BillingResult<ProcessOutcome> {
        if is_cancellation_event(&event.event_type) {
            return self.process_cancellation(event).await;
        }

        if !is_payment_event(&event.event_type) {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No handler for event type, committing as no-op"
            );
            return self.commit_noop(event.id).await;
        }

        let Some(mp_id) = event.mp_id.as_deref() else {
            tracing::warn!(
                event_id = %event.id,
                request_id = %event.request_id,
                "Payment event without data.id, committing as no-op"
            );
            return self.commit_noop(event.id).await;
        };

        // Step 2a: authoritative provider state. The notification body only
        // carries the payment id; synthetic sweep events embed the full
        // payment so no network call is needed for them.
        let provider = match embedded_payment(&event.payload) {
            Some(p) => p,
            None => match self.client.get_payment(mp_id).await {
                Ok(p) => p,
                Err(BillingError::ProviderApi { status: 404, .. }) => {
                    tracing::warn!(
                        event_id = %event.id,
                        mp_payment_id = %mp_id,
                        "Provider does not know this payment, committing as no-op"
                    );
                    return self.commit_noop(event.id).await;
                }
                Err(e) => return Err(e),
            },
        };

        let Some(status) = ProviderStatus::parse(&provider.status) else {
            tracing::warn!(
                event_id = %event.id,
                mp_payment_id = %mp_id,
                provider_status = %provider.status,
                "Unknown provider status, committing as no-op"
            );
            return self.commit_noop(event.id).await;
        };

        // Steps 2b-5 share one transaction: claim-to-commit atomicity.
        let mut tx = self.pool.begin().await?;

        // Step 2b: resolve the payment row, synthesizing one when the
        // provider event precedes the local payment-intent record.
        let payment = match self.ledger.find_by_mp_id(&mut tx, mp_id).await? {
            Some(p) => p,
            None => {
                let Some((business_id, plan)) = synthesis_source(&provider) else {
                    tracing::warn!(
                        event_id = %event.id,
                        mp_payment_id = %mp_id,
                        "No local payment and payload lacks business/plan, committing as no-op"
                    );
                    self.store.mark_processed(&mut tx, event.id).await?;
                    tx.commit().await?;
                    return Ok(ProcessOutcome::NoEffect);
                };
                self.ledger
                    .create_from_provider(&mut tx, &provider, business_id, plan)
                    .await?
            }
        };

        // Step 3: idempotent status reconciliation.
        match merge_decision(payment.mp_status.as_deref(), status) {
            MergeDecision::Duplicate => {
                tracing::info!(
                    event_id = %event.id,
                    mp_payment_id = %mp_id,
                    status = %status,
                    "Status already reflected, no-op"
                );
                self.store.mark_processed(&mut tx, event.id).await?;
                tx.commit().await?;
                return Ok(ProcessOutcome::NoEffect);
            }
            MergeDecision::StaleConflict => {
                tracing::warn!(
                    event_id = %event.id,
                    mp_payment_id = %mp_id,
                    current_status = ?payment.mp_status,
                    incoming_status = %status,
                    "Conflicting state transition dropped, most terminal wins"
                );
                self.store.mark_processed(&mut tx, event.id).await?;
                tx.commit().await?;
                return Ok(ProcessOutcome::NoEffect);
            }
            MergeDecision::Apply => {}
        }

        self.ledger.record_status(&mut tx, payment.id, status).await?;

        // Step 4: subscription transition, only on terminal payment states.
        if status.is_terminal() {
            let signal = match status {
                ProviderStatus::Approved => SubscriptionSignal::PaymentApproved {
                    plan: payment.plan()?,
                    at: time::OffsetDateTime::now_utc(),
                },
                ProviderStatus::Rejected | ProviderStatus::Cancelled => {
                    SubscriptionSignal::PaymentFailed
                }
                ProviderStatus::Refunded | ProviderStatus::ChargedBack => {
                    SubscriptionSignal::PaymentRefunded
                }
                _ => unreachable!("non-terminal statuses filtered above"),
            };

            self.subscriptions
                .apply(&mut tx, payment.business_id, signal)
                .await?;
        }

        // Step 5: commit everything together.
        self.store.mark_processed(&mut tx, event.id).await?;
        tx.commit().await?;

        tracing::info!(
            event_id = %event.id,
            request_id = %event.request_id,
            mp_payment_id = %mp_id,
            status = %status,
            business_id = %payment.business_id,
            "Webhook event applied"
        );

        Ok(ProcessOutcome::Applied)
    }

    /// Explicit subscription cancellation: CANCELLED, plan retained until
    /// the paid term lapses.
    async fn process_cancellation(
        &self,
        event: &WebhookEventRecord,
    ) -> BillingResult<ProcessOutcome> {
        let Some(business_id) = cancellation_business_id(&event.payload) else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Cancellation event without resolvable business, committing as no-op"
            );
            return self.commit_noop(event.id).await;
        };

        let mut tx = self.pool.begin().await?;

        let applied = self
            .subscriptions
            .apply(&mut tx, business_id, SubscriptionSignal::Cancellation)
            .await?;

        self.store.mark_processed(&mut tx, event.id).await?;
        tx.commit().await?;

        Ok(if applied.is_some() {
            ProcessOutcome::Applied
        } else {
            ProcessOutcome::NoEffect
        })
    }

    /// Commit the event as processed with no state change.
    ///
    /// Used for events the pipeline cannot act on; leaving them unprocessed
    /// would make the sweep retry them forever.
    async fn commit_noop(&self, event_id: Uuid) -> BillingResult<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;
        self.store.mark_processed(&mut tx, event_id).await?;
        tx.commit().await?;
        Ok(ProcessOutcome::NoEffect)
    }
}

/// Payment lifecycle notifications: `payment`, `payment.created`,
/// `payment.updated`.
pub fn is_payment_event(event_type: &str) -> bool {
    event_type == "payment" || event_type.starts_with("payment.")
}

/// Subscription cancellation notifications from the preapproval product.
pub fn is_cancellation_event(event_type: &str) -> bool {
    event_type.contains("preapproval") && event_type.ends_with(".cancelled")
        || event_type == "subscription.cancelled"
}

/// Synthetic sweep events embed the full provider payment under `data`.
/// Receiver-ingested notifications only carry `data.id`, which this rejects
/// (no `status` field).
fn embedded_payment(payload: &serde_json::Value) -> Option<ProviderPayment> {
    let data = payload.get("data")?;
    data.get("status")?;
    serde_json::from_value(data.clone()).ok()
}

/// Business id and plan needed to synthesize a missing payment row.
fn synthesis_source(provider: &ProviderPayment) -> Option<(Uuid, Plan)> {
    let business_id: Uuid = provider.external_reference.as_deref()?.parse().ok()?;
    let plan: Plan = provider.declared_plan()?.parse().ok()?;
    Some((business_id, plan))
}

/// Business a cancellation event applies to, from the payload's
/// `external_reference` (set when the preapproval was created).
fn cancellation_business_id(payload: &serde_json::Value) -> Option<Uuid> {
    let raw = payload
        .get("data")
        .and_then(|d| d.get("external_reference"))
        .or_else(|| payload.get("external_reference"))?
        .as_str()?;
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_event_types_are_recognized() {
        assert!(is_payment_event("payment"));
        assert!(is_payment_event("payment.created"));
        assert!(is_payment_event("payment.updated"));
        assert!(!is_payment_event("plan"));
        assert!(!is_payment_event("subscription_preapproval.cancelled"));
    }

    #[test]
    fn cancellation_event_types_are_recognized() {
        assert!(is_cancellation_event("subscription_preapproval.cancelled"));
        assert!(is_cancellation_event("subscription.cancelled"));
        assert!(!is_cancellation_event("subscription_preapproval.updated"));
        assert!(!is_cancellation_event("payment.updated"));
    }

    #[test]
    fn embedded_payment_requires_a_status() {
        // Receiver-ingested notification: only an id, must NOT parse
        let thin = serde_json::json!({"type": "payment", "data": {"id": 123}});
        assert!(embedded_payment(&thin).is_none());

        // Synthetic sweep event: full payment body
        let full = serde_json::json!({
            "action": "payment.updated",
            "data": {"id": 123, "status": "approved", "transaction_amount": 10.0}
        });
        let p = embedded_payment(&full).unwrap();
        assert_eq!(p.status, "approved");
    }

    #[test]
    fn synthesis_needs_both_business_and_plan() {
        let full: ProviderPayment = serde_json::from_value(serde_json::json!({
            "id": 1, "status": "approved",
            "external_reference": "b6f7a1de-0000-0000-0000-000000000001",
            "metadata": {"plan": "basic"}
        }))
        .unwrap();
        let (business_id, plan) = synthesis_source(&full).unwrap();
        assert_eq!(
            business_id.to_string(),
            "b6f7a1de-0000-0000-0000-000000000001"
        );
        assert_eq!(plan, Plan::Basic);

        let no_plan: ProviderPayment = serde_json::from_value(serde_json::json!({
            "id": 1, "status": "approved",
            "external_reference": "b6f7a1de-0000-0000-0000-000000000001"
        }))
        .unwrap();
        assert!(synthesis_source(&no_plan).is_none());

        let bad_ref: ProviderPayment = serde_json::from_value(serde_json::json!({
            "id": 1, "status": "approved",
            "external_reference": "not-a-uuid",
            "metadata": {"plan": "basic"}
        }))
        .unwrap();
        assert!(synthesis_source(&bad_ref).is_none());
    }

    #[test]
    fn cancellation_business_id_reads_both_shapes() {
        let nested = serde_json::json!({
            "type": "subscription_preapproval",
            "data": {"id": "pre_1", "external_reference": "b6f7a1de-0000-0000-0000-000000000001"}
        });
        assert!(cancellation_business_id(&nested).is_some());

        let top = serde_json::json!({
            "type": "subscription_preapproval",
            "external_reference": "b6f7a1de-0000-0000-0000-000000000001"
        });
        assert!(cancellation_business_id(&top).is_some());

        let missing = serde_json::json!({"type": "subscription_preapproval", "data": {"id": 1}});
        assert!(cancellation_business_id(&missing).is_none());
    }
}
