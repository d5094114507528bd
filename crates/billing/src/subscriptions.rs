//! Business subscription state machine
//!
//! The `businesses.{plan, plan_status, plan_expires_at}` columns are the
//! state machine target. All mutations route through this service inside the
//! event processor's transaction; nothing else in the system writes these
//! columns (except the worker's expiry demotion job, which also lives here).
//!
//! States: FREE/ACTIVE (default), {BASIC,PREMIUM}/ACTIVE,
//! {BASIC,PREMIUM}/INACTIVE, {BASIC,PREMIUM}/CANCELLED,
//! {BASIC,PREMIUM}/EXPIRED.

use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use vitrina_shared::{Plan, PlanStatus, BILLING_PERIOD_DAYS};

use crate::error::{BillingError, BillingResult};

/// Subscription-relevant subset of a business row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionState {
    pub plan: Plan,
    pub status: PlanStatus,
    pub expires_at: Option<OffsetDateTime>,
}

impl SubscriptionState {
    /// Default state for a business that never paid.
    pub fn free() -> Self {
        Self {
            plan: Plan::Free,
            status: PlanStatus::Active,
            expires_at: None,
        }
    }
}

/// Input that can drive a subscription transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSignal {
    /// Payment for `plan` reached approved/completed.
    PaymentApproved { plan: Plan, at: OffsetDateTime },
    /// Payment reached rejected/failed/cancelled.
    PaymentFailed,
    /// Provider refund or chargeback landed.
    PaymentRefunded,
    /// Explicit cancellation of the subscription (not of one payment).
    Cancellation,
}

/// Pure transition function. Returns the new state, or `None` when the
/// signal has no effect on the current state.
///
/// - Approved payment for plan P: P/ACTIVE with a fresh 30-day term. This
///   also covers renewals (term extends from `at`, not from the old expiry).
/// - Failed payment: never changes the plan. A failed renewal leaves an
///   active plan active; a failed first purchase leaves the business FREE.
/// - Refund: INACTIVE immediately, independent of the expiry date. Only
///   meaningful while on a paid plan.
/// - Cancellation: CANCELLED, plan retained until the term lapses; the
///   worker's expiry job later demotes to FREE/EXPIRED. Does not undo a
///   refund (INACTIVE is more terminal than CANCELLED).
pub fn transition(
    current: SubscriptionState,
    signal: SubscriptionSignal,
) -> Option<SubscriptionState> {
    match signal {
        SubscriptionSignal::PaymentApproved { plan, at } => {
            if !plan.is_paid() {
                return None;
            }
            Some(SubscriptionState {
                plan,
                status: PlanStatus::Active,
                expires_at: Some(at + Duration::days(BILLING_PERIOD_DAYS)),
            })
        }
        SubscriptionSignal::PaymentFailed => None,
        SubscriptionSignal::PaymentRefunded => {
            if !current.plan.is_paid() || current.status == PlanStatus::Inactive {
                return None;
            }
            Some(SubscriptionState {
                status: PlanStatus::Inactive,
                ..current
            })
        }
        SubscriptionSignal::Cancellation => {
            if !current.plan.is_paid()
                || matches!(current.status, PlanStatus::Inactive | PlanStatus::Cancelled)
            {
                return None;
            }
            Some(SubscriptionState {
                status: PlanStatus::Cancelled,
                ..current
            })
        }
    }
}

/// Transactional access to the subscription columns on businesses.
#[derive(Debug, Clone)]
pub struct SubscriptionService;

impl SubscriptionService {
    /// Load a business's subscription state, locking the row for the rest of
    /// the transaction.
    pub async fn load_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
    ) -> BillingResult<SubscriptionState> {
        let row: Option<(String, String, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT plan, plan_status, plan_expires_at
            FROM businesses
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(business_id)
        .fetch_optional(&mut **tx)
        .await?;

        let (plan, status, expires_at) =
            row.ok_or_else(|| BillingError::BusinessNotFound(business_id.to_string()))?;

        Ok(SubscriptionState {
            plan: plan
                .parse()
                .map_err(|_| BillingError::Internal(format!("unknown plan '{}' on business", plan)))?,
            status: status.parse().map_err(|_| {
                BillingError::Internal(format!("unknown plan_status '{}' on business", status))
            })?,
            expires_at,
        })
    }

    /// Apply a signal to one business inside the caller's transaction.
    ///
    /// Returns the new state when the signal changed something, `None` for
    /// no-ops. No-ops include stale conflicts; the caller logs them.
    pub async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
        signal: SubscriptionSignal,
    ) -> BillingResult<Option<SubscriptionState>> {
        let current = self.load_for_update(tx, business_id).await?;

        let Some(next) = transition(current, signal) else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE businesses
            SET plan = $1, plan_status = $2, plan_expires_at = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(next.plan.as_str())
        .bind(next.status.as_str())
        .bind(next.expires_at)
        .bind(business_id)
        .execute(&mut **tx)
        .await?;

        tracing::info!(
            business_id = %business_id,
            old_plan = %current.plan,
            old_status = %current.status,
            new_plan = %next.plan,
            new_status = %next.status,
            expires_at = ?next.expires_at,
            "Subscription transition applied"
        );

        Ok(Some(next))
    }

    /// Demote businesses whose paid term lapsed to FREE/EXPIRED.
    ///
    /// Run by the worker on a schedule; CANCELLED plans ride out their term
    /// and land here, ACTIVE plans land here when a renewal never arrived.
    /// Businesses already INACTIVE keep that status (refund already took the
    /// entitlement away).
    pub async fn demote_expired(&self, pool: &PgPool) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE businesses
            SET plan = 'free', plan_status = 'expired', updated_at = NOW()
            WHERE plan != 'free'
              AND plan_expires_at IS NOT NULL
              AND plan_expires_at < NOW()
              AND plan_status IN ('active', 'cancelled')
            "#,
        )
        .execute(pool)
        .await?;

        let demoted = result.rows_affected();
        if demoted > 0 {
            tracing::info!(demoted = demoted, "Expired paid plans demoted to free");
        }

        Ok(demoted)
    }
}
