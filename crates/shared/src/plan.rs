//! Subscription plan vocabulary
//!
//! `Plan` is the entitlement a business has paid for; `PlanStatus` is the
//! lifecycle of the current paid term. Both are stored as lowercase text
//! columns on `businesses` and must round-trip through `as_str`/`parse`.

use serde::{Deserialize, Serialize};

/// Length of one paid billing term, in days.
///
/// Both paid tiers renew on the same 30-day cycle.
pub const BILLING_PERIOD_DAYS: i64 = 30;

/// Subscription tier a business is entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Premium => "premium",
        }
    }

    /// Whether this tier requires a paid subscription.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }
}

impl std::str::FromStr for Plan {
    type Err = InvalidPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "premium" => Ok(Plan::Premium),
            other => Err(InvalidPlan(other.to_string())),
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of the current plan term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Inactive,
    Cancelled,
    Expired,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Inactive => "inactive",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = InvalidPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(PlanStatus::Active),
            "inactive" => Ok(PlanStatus::Inactive),
            "cancelled" | "canceled" => Ok(PlanStatus::Cancelled),
            "expired" => Ok(PlanStatus::Expired),
            other => Err(InvalidPlan(other.to_string())),
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error for unknown plan or plan-status strings.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown plan value: {0}")]
pub struct InvalidPlan(pub String);
