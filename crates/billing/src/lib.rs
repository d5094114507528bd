// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vitrina Billing Module
//!
//! Handles Mercado Pago integration for paid subscription tiers.
//!
//! ## Features
//!
//! - **Webhook Ingestion**: Signature-verified, ack-first persistence of
//!   provider notifications with insert-if-absent deduplication
//! - **Event Processing**: Claim-based, exactly-once-in-effect application of
//!   events to the payment ledger and subscription state machine
//! - **Status Reconciliation**: "Most terminal wins" merging of out-of-order
//!   provider statuses
//! - **Reconciliation Sweep**: Retry of stuck events and polling fallback for
//!   payments the provider never notified us about

pub mod client;
pub mod error;
pub mod events;
pub mod payments;
pub mod processor;
pub mod subscriptions;
pub mod sweep;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{MercadoPagoClient, MercadoPagoConfig, ProviderPayment};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventStore, IngestOutcome, NewWebhookEvent, WebhookEventRecord, CLAIM_GRACE};

// Payments
pub use payments::{
    merge_decision, MergeDecision, PaymentLedger, PaymentRecord, PaymentStatus, ProviderStatus,
};

// Processor
pub use processor::{EventProcessor, ProcessOutcome};

// Subscriptions
pub use subscriptions::{transition, SubscriptionService, SubscriptionSignal, SubscriptionState};

// Sweep
pub use sweep::{ReconciliationSweep, SweepReport};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookNotification};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Debug, Clone)]
pub struct BillingService {
    pub webhooks: WebhookHandler,
    pub processor: EventProcessor,
    pub sweep: ReconciliationSweep,
    pub subscriptions: SubscriptionService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let client = MercadoPagoClient::from_env()?;
        Ok(Self::new(client, pool))
    }

    /// Create a new billing service with an explicit client
    pub fn new(client: MercadoPagoClient, pool: PgPool) -> Self {
        let webhook_secret = client.config().webhook_secret.clone();
        Self {
            webhooks: WebhookHandler::new(pool.clone(), webhook_secret),
            processor: EventProcessor::new(pool.clone(), client.clone()),
            sweep: ReconciliationSweep::new(pool, client),
            subscriptions: SubscriptionService,
        }
    }
}
