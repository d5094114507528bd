//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors from webhook ingestion, event processing and provider calls.
///
/// Duplicate deliveries and conflicting (stale) state transitions are NOT
/// errors: they resolve to no-op outcomes inside the services and never
/// surface through this type.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Durable storage unavailable or query failed. Retryable: ingestion
    /// surfaces this to the provider as a retryable HTTP error, processing
    /// releases the claim and lets the sweep re-attempt.
    #[error("database error: {0}")]
    Database(String),

    /// Webhook signature missing, malformed, stale or wrong. The event is
    /// discarded without being persisted.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Notification body could not be interpreted (missing type, missing
    /// data.id, non-JSON body).
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Mercado Pago read API unreachable or timed out. Soft failure: the
    /// caller releases its claim and retries later.
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Mercado Pago returned a non-success response for a status query.
    #[error("payment provider api error: status {status}, body {body}")]
    ProviderApi { status: u16, body: String },

    /// No Payment row matches the provider payment id and the event payload
    /// carries too little to synthesize one.
    #[error("payment not found for provider id {0}")]
    PaymentNotFound(String),

    /// Event references a business that does not exist locally.
    #[error("business not found: {0}")]
    BusinessNotFound(String),

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            BillingError::ProviderUnavailable(e.to_string())
        } else {
            BillingError::ProviderApi {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                body: e.to_string(),
            }
        }
    }
}

impl BillingError {
    /// Whether the failure is transient and the operation should be retried
    /// (by the provider's redelivery for ingestion, by the sweep for
    /// processing).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::ProviderUnavailable(_)
        )
    }
}
