//! Payment ledger and provider status reconciliation
//!
//! The ledger is keyed by the Mercado Pago payment id (`mp_payment_id`).
//! Status updates are idempotent under reordering: the terminal-rank table
//! below decides whether an incoming provider status advances the row, is a
//! duplicate, or is a stale out-of-order notification that must not regress
//! a more-terminal state ("most terminal wins").

use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;
use vitrina_shared::Plan;

use crate::client::ProviderPayment;
use crate::error::{BillingError, BillingResult};

/// Local payment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// Mercado Pago payment status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    InProcess,
    InMediation,
    Authorized,
    Approved,
    Rejected,
    Cancelled,
    Refunded,
    ChargedBack,
}

impl ProviderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProviderStatus::Pending),
            "in_process" => Some(ProviderStatus::InProcess),
            "in_mediation" => Some(ProviderStatus::InMediation),
            "authorized" => Some(ProviderStatus::Authorized),
            "approved" => Some(ProviderStatus::Approved),
            "rejected" => Some(ProviderStatus::Rejected),
            "cancelled" => Some(ProviderStatus::Cancelled),
            "refunded" => Some(ProviderStatus::Refunded),
            "charged_back" => Some(ProviderStatus::ChargedBack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::InProcess => "in_process",
            ProviderStatus::InMediation => "in_mediation",
            ProviderStatus::Authorized => "authorized",
            ProviderStatus::Approved => "approved",
            ProviderStatus::Rejected => "rejected",
            ProviderStatus::Cancelled => "cancelled",
            ProviderStatus::Refunded => "refunded",
            ProviderStatus::ChargedBack => "charged_back",
        }
    }

    /// Terminal ordering. A status never overwrites one with a higher rank.
    ///
    /// refunded/charged_back (3) > cancelled (2) > approved/rejected (1)
    /// > pending/in_process/in_mediation/authorized (0). Refunds outrank
    /// cancellation because money has already moved back.
    pub fn terminal_rank(&self) -> u8 {
        match self {
            ProviderStatus::Pending
            | ProviderStatus::InProcess
            | ProviderStatus::InMediation
            | ProviderStatus::Authorized => 0,
            ProviderStatus::Approved | ProviderStatus::Rejected => 1,
            ProviderStatus::Cancelled => 2,
            ProviderStatus::Refunded | ProviderStatus::ChargedBack => 3,
        }
    }

    /// Terminal statuses drive a subscription transition; pre-terminal ones
    /// only update the ledger row.
    pub fn is_terminal(&self) -> bool {
        self.terminal_rank() >= 1
    }

    /// Local status this provider status maps to.
    pub fn local_status(&self) -> PaymentStatus {
        match self {
            ProviderStatus::Pending
            | ProviderStatus::InProcess
            | ProviderStatus::InMediation
            | ProviderStatus::Authorized => PaymentStatus::Pending,
            ProviderStatus::Approved => PaymentStatus::Completed,
            ProviderStatus::Rejected | ProviderStatus::Cancelled => PaymentStatus::Failed,
            ProviderStatus::Refunded | ProviderStatus::ChargedBack => PaymentStatus::Refunded,
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of comparing an incoming provider status against the last one
/// reflected on the ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// The incoming status advances the row.
    Apply,
    /// Same status already reflected; out-of-order duplicate, no-op.
    Duplicate,
    /// The incoming status is less terminal than what the row already holds.
    /// Applying it would regress state; logged and dropped.
    StaleConflict,
}

/// Decide whether `incoming` may overwrite the stored `current` mp_status.
pub fn merge_decision(current: Option<&str>, incoming: ProviderStatus) -> MergeDecision {
    let Some(current) = current else {
        return MergeDecision::Apply;
    };
    if current == incoming.as_str() {
        return MergeDecision::Duplicate;
    }
    match ProviderStatus::parse(current) {
        Some(cur) if incoming.terminal_rank() < cur.terminal_rank() => MergeDecision::StaleConflict,
        // Unknown stored status: trust the parseable incoming one.
        _ => MergeDecision::Apply,
    }
}

/// One row of the payments table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub payment_method: Option<String>,
    pub mp_payment_id: Option<String>,
    pub mp_status: Option<String>,
    pub plan: String,
    pub business_id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    pub fn plan(&self) -> BillingResult<Plan> {
        self.plan
            .parse()
            .map_err(|_| BillingError::Internal(format!("payment {} has unknown plan", self.id)))
    }
}

/// Transactional access to the payments table.
///
/// Every method takes the caller's transaction: a payment mutation is only
/// ever visible together with the event/business writes it belongs to.
#[derive(Debug, Clone)]
pub struct PaymentLedger;

impl PaymentLedger {
    /// Look up a payment by provider id, locking the row so concurrent
    /// workers racing on the same `mp_payment_id` serialize here.
    pub async fn find_by_mp_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        mp_payment_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let payment: Option<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, amount, currency, status, payment_method,
                   mp_payment_id, mp_status, plan, business_id,
                   created_at, updated_at
            FROM payments
            WHERE mp_payment_id = $1
            FOR UPDATE
            "#,
        )
        .bind(mp_payment_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(payment)
    }

    /// Create a payment row from the provider's view of it.
    ///
    /// Covers provider events that precede the local payment-intent record.
    /// `ON CONFLICT DO NOTHING` plus the re-read keeps this safe if another
    /// transaction inserted the same provider id first.
    pub async fn create_from_provider(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        provider: &ProviderPayment,
        business_id: Uuid,
        plan: Plan,
    ) -> BillingResult<PaymentRecord> {
        let mp_id = provider.mp_id();
        let currency = provider
            .currency_id
            .clone()
            .unwrap_or_else(|| "ARS".to_string());

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, amount, currency, status, payment_method,
                 mp_payment_id, mp_status, plan, business_id, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, NULL, $6, $7, NOW(), NOW())
            ON CONFLICT (mp_payment_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider.transaction_amount)
        .bind(&currency)
        .bind(provider.payment_method_id.as_ref())
        .bind(&mp_id)
        .bind(plan.as_str())
        .bind(business_id)
        .execute(&mut **tx)
        .await?;

        self.find_by_mp_id(tx, &mp_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(mp_id))
    }

    /// Record a reconciled provider status on the ledger row.
    ///
    /// The caller has already run `merge_decision`; this is the write half.
    pub async fn record_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
        status: ProviderStatus,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, mp_status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.local_status().as_str())
        .bind(status.as_str())
        .bind(payment_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Payments still in a non-terminal local status with no update since
    /// `cutoff`. The sweep polls the provider for these.
    pub async fn stale_pending(
        &self,
        pool: &sqlx::PgPool,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let payments: Vec<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, amount, currency, status, payment_method,
                   mp_payment_id, mp_status, plan, business_id,
                   created_at, updated_at
            FROM payments
            WHERE status = 'pending'
              AND mp_payment_id IS NOT NULL
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(payments)
    }
}
