//! Mercado Pago API client
//!
//! Thin wrapper over the provider's read API. Only the payment status query
//! is needed: webhooks carry a payment id, and the authoritative status is
//! always fetched or confirmed against `/v1/payments/{id}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASE_URL: &str = "https://api.mercadopago.com";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Mercado Pago configuration
#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    /// Bearer token for the read API.
    pub access_token: String,
    /// Secret used to verify the `x-signature` header on inbound webhooks.
    pub webhook_secret: String,
    /// API base URL (overridable for tests/sandbox).
    pub base_url: String,
    /// Per-request timeout for outbound status queries.
    pub request_timeout: Duration,
}

impl MercadoPagoConfig {
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("MP_ACCESS_TOKEN")
            .map_err(|_| BillingError::Config("MP_ACCESS_TOKEN not set".to_string()))?;
        let webhook_secret = std::env::var("MP_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("MP_WEBHOOK_SECRET not set".to_string()))?;
        let base_url =
            std::env::var("MP_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let request_timeout = std::env::var("MP_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Ok(Self {
            access_token,
            webhook_secret,
            base_url,
            request_timeout,
        })
    }
}

/// Payment object as returned by `GET /v1/payments/{id}`.
///
/// Only the fields the reconciliation path consumes are typed; everything
/// else the provider sends is ignored on deserialization. Serializable so
/// the reconciliation sweep can embed it in synthetic events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub transaction_amount: f64,
    #[serde(default)]
    pub currency_id: Option<String>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    /// Checkout flows set this to the local business id.
    #[serde(default)]
    pub external_reference: Option<String>,
    /// Checkout flows set `metadata.plan` to the tier being purchased.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ProviderPayment {
    /// Provider payment id as the string form used for the join key.
    pub fn mp_id(&self) -> String {
        self.id.to_string()
    }

    /// Declared plan from checkout metadata, if present.
    pub fn declared_plan(&self) -> Option<&str> {
        self.metadata.get("plan").and_then(|v| v.as_str())
    }
}

/// Client for the Mercado Pago read API
#[derive(Debug, Clone)]
pub struct MercadoPagoClient {
    config: MercadoPagoConfig,
    http: reqwest::Client,
}

impl MercadoPagoClient {
    pub fn new(config: MercadoPagoConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(MercadoPagoConfig::from_env()?)
    }

    pub fn config(&self) -> &MercadoPagoConfig {
        &self.config
    }

    /// Fetch the authoritative state of one payment.
    ///
    /// Timeouts and connection failures map to `ProviderUnavailable` so the
    /// caller can release its claim and retry later instead of aborting.
    pub async fn get_payment(&self, mp_payment_id: &str) -> BillingResult<ProviderPayment> {
        let url = format!("{}/v1/payments/{}", self.config.base_url, mp_payment_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                mp_payment_id = %mp_payment_id,
                status = status.as_u16(),
                "Payment status query rejected by provider"
            );
            return Err(BillingError::ProviderApi {
                status: status.as_u16(),
                body,
            });
        }

        let payment: ProviderPayment = response.json().await?;

        tracing::debug!(
            mp_payment_id = %mp_payment_id,
            provider_status = %payment.status,
            "Fetched payment from provider"
        );

        Ok(payment)
    }
}
