//! Reconciliation sweep
//!
//! Guarantees forward progress when a processor claim is abandoned (worker
//! crash) or the provider silently drops a webhook:
//!
//! - stale unprocessed events are re-fed through the processor (re-claiming
//!   is safe by construction),
//! - payments stuck pending with no event activity get an out-of-band status
//!   query, and the result is fed through the normal ingest-then-process
//!   path as a synthetic event.
//!
//! This bounds the worst-case latency of "at-least-once delivery,
//! effectively-once effect" to the sweep interval instead of leaving it
//! unbounded on provider outages.

use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::client::MercadoPagoClient;
use crate::error::BillingResult;
use crate::events::{IngestOutcome, NewWebhookEvent};
use crate::payments::PaymentLedger;
use crate::processor::{EventProcessor, ProcessOutcome};

/// Events younger than this are left alone; the inline processing path is
/// probably still working on them.
pub const EVENT_GRACE: Duration = Duration::minutes(5);

/// A pending payment with no ledger update for this long gets polled.
pub const PAYMENT_POLL_WINDOW: Duration = Duration::hours(1);

const BATCH_LIMIT: i64 = 100;

/// Counters from one sweep pass, for the worker's logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub scanned: usize,
    pub applied: usize,
    pub no_effect: usize,
    pub deferred: usize,
    pub errors: usize,
}

/// Periodic retry pass over stuck events and silent payments.
#[derive(Debug, Clone)]
pub struct ReconciliationSweep {
    processor: EventProcessor,
    ledger: PaymentLedger,
    client: MercadoPagoClient,
    pool: sqlx::PgPool,
}

impl ReconciliationSweep {
    pub fn new(pool: sqlx::PgPool, client: MercadoPagoClient) -> Self {
        Self {
            processor: EventProcessor::new(pool.clone(), client.clone()),
            ledger: PaymentLedger,
            client,
            pool,
        }
    }

    /// Retry events stuck unprocessed beyond the grace window.
    pub async fn run_once(&self) -> BillingResult<SweepReport> {
        let stale = self
            .processor
            .event_store()
            .stale_unprocessed(EVENT_GRACE, BATCH_LIMIT)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for event in &stale {
            match self.processor.process(event).await {
                Ok(ProcessOutcome::Applied) => report.applied += 1,
                Ok(ProcessOutcome::NoEffect) => report.no_effect += 1,
                Ok(ProcessOutcome::Deferred) => report.deferred += 1,
                Ok(ProcessOutcome::AlreadyHandled) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        event_id = %event.id,
                        request_id = %event.request_id,
                        error = %e,
                        "Sweep failed to process stale event"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                applied = report.applied,
                no_effect = report.no_effect,
                deferred = report.deferred,
                errors = report.errors,
                "Stale event sweep complete"
            );
        }

        Ok(report)
    }

    /// Polling fallback for payments the provider never (successfully)
    /// notified us about.
    ///
    /// Each stale pending payment gets a backed-off status query; the result
    /// is wrapped in a synthetic event whose request_id is derived from the
    /// payment id and status, so repeated polls of an unchanged payment dedup
    /// at the event store like any other redelivery.
    pub async fn poll_pending_payments(&self) -> BillingResult<SweepReport> {
        let cutoff = OffsetDateTime::now_utc() - PAYMENT_POLL_WINDOW;
        let stale = self
            .ledger
            .stale_pending(&self.pool, cutoff, BATCH_LIMIT)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for payment in &stale {
            let Some(mp_id) = payment.mp_payment_id.as_deref() else {
                continue;
            };

            // The provider read API is rate-limited and flaky; back off
            // between attempts and give up until the next sweep pass.
            let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
            let provider = match Retry::start(strategy, || self.client.get_payment(mp_id)).await {
                Ok(p) => p,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        mp_payment_id = %mp_id,
                        error = %e,
                        "Polling fallback could not fetch payment"
                    );
                    continue;
                }
            };

            match self.ingest_synthetic(mp_id, &provider).await {
                Ok(ProcessOutcome::Applied) => report.applied += 1,
                Ok(ProcessOutcome::NoEffect | ProcessOutcome::AlreadyHandled) => {
                    report.no_effect += 1
                }
                Ok(ProcessOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        mp_payment_id = %mp_id,
                        error = %e,
                        "Failed to apply polled payment status"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                applied = report.applied,
                no_effect = report.no_effect,
                errors = report.errors,
                "Pending payment poll complete"
            );
        }

        Ok(report)
    }

    /// Feed a polled payment through the normal ingest → process path.
    async fn ingest_synthetic(
        &self,
        mp_id: &str,
        provider: &crate::client::ProviderPayment,
    ) -> BillingResult<ProcessOutcome> {
        let payload = serde_json::json!({
            "action": "payment.updated",
            "source": "reconciliation_poll",
            "data": provider,
        });

        let outcome = self
            .processor
            .event_store()
            .ingest(NewWebhookEvent {
                request_id: synthetic_request_id(mp_id, &provider.status),
                event_type: "payment.updated".to_string(),
                mp_id: Some(mp_id.to_string()),
                payload,
            })
            .await?;

        match outcome {
            IngestOutcome::Accepted(event_id) => self.processor.process_by_id(event_id).await,
            // This payment+status pair was already seen (webhook arrived
            // after all, or a previous poll); nothing new to apply.
            IngestOutcome::Duplicate => Ok(ProcessOutcome::AlreadyHandled),
        }
    }
}

/// Deterministic request_id for a polled status, so the synthetic event
/// dedups exactly like a provider redelivery would.
pub fn synthetic_request_id(mp_id: &str, status: &str) -> String {
    format!("poll:{}:{}", mp_id, status)
}
