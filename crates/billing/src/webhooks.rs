//! Mercado Pago webhook handling
//!
//! Verifies the `x-signature` header, parses the notification envelope and
//! persists the delivery to the event store. This is the ack-first path: no
//! business state is mutated here, so the HTTP handler can return as soon as
//! the row is durable and redelivery stays safe.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventStore, IngestOutcome, NewWebhookEvent};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps outside this window are rejected (replay protection).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Parsed notification envelope.
///
/// Mercado Pago's body is loosely structured and changes across products;
/// only the fields the pipeline consumes are extracted, the raw body is
/// preserved verbatim in the event row.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    /// Provider event category, e.g. `payment.created`, `payment.updated`.
    pub event_type: String,
    /// Provider-side payment/object id referenced by the event.
    pub data_id: Option<String>,
    /// Raw body, kept for replay and audit.
    pub payload: serde_json::Value,
}

impl WebhookNotification {
    /// Parse the raw request body.
    ///
    /// `action` is preferred over `type` for the event category because it
    /// carries the verb (`payment.updated` vs just `payment`).
    pub fn parse(body: &str) -> BillingResult<Self> {
        let payload: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| BillingError::InvalidPayload(format!("body is not JSON: {}", e)))?;

        let event_type = payload
            .get("action")
            .and_then(|v| v.as_str())
            .or_else(|| payload.get("type").and_then(|v| v.as_str()))
            .ok_or_else(|| {
                BillingError::InvalidPayload("missing both 'action' and 'type'".to_string())
            })?
            .to_string();

        // data.id arrives as a string or a number depending on the product
        let data_id = payload
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(|id| {
                id.as_str()
                    .map(|s| s.to_string())
                    .or_else(|| id.as_i64().map(|n| n.to_string()))
            });

        Ok(Self {
            event_type,
            data_id,
            payload,
        })
    }
}

/// Webhook receiver for Mercado Pago notifications
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    store: EventStore,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        Self {
            store: EventStore::new(pool),
            webhook_secret,
        }
    }

    /// Verify the `x-signature` header against the signed manifest.
    pub fn verify_signature(
        &self,
        signature: &str,
        request_id: Option<&str>,
        data_id: Option<&str>,
    ) -> BillingResult<()> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        verify_signature_at(&self.webhook_secret, signature, request_id, data_id, now)
    }

    /// Verify, parse and durably persist one inbound notification.
    ///
    /// Returns `Duplicate` for redeliveries (no-op success). Storage failure
    /// propagates as a retryable error and nothing is acknowledged, so the
    /// provider's own retry mechanism re-delivers later.
    pub async fn receive(
        &self,
        body: &str,
        signature: &str,
        request_id: Option<&str>,
    ) -> BillingResult<IngestOutcome> {
        let notification = WebhookNotification::parse(body)?;

        self.verify_signature(signature, request_id, notification.data_id.as_deref())?;

        let request_id = match request_id {
            Some(rid) => rid.to_string(),
            // Provider omitted the idempotency token: derive one
            // deterministically from the raw payload so redeliveries of the
            // same body still dedup.
            None => Self::derived_request_id(body),
        };

        self.store
            .ingest(NewWebhookEvent {
                request_id,
                event_type: notification.event_type,
                mp_id: notification.data_id,
                payload: notification.payload,
            })
            .await
    }

    /// Deterministic request-id fallback: SHA-256 of the raw body.
    pub fn derived_request_id(body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }
}

/// Verify an `x-signature` header value at a given reference time.
///
/// The header carries `ts=<unix>,v1=<hex hmac>`; the HMAC-SHA256 is computed
/// over `id:{data_id};request-id:{request_id};ts:{ts};` with the webhook
/// secret, per Mercado Pago's documented template. Segments for absent
/// values are omitted from the manifest.
fn verify_signature_at(
    secret: &str,
    signature: &str,
    request_id: Option<&str>,
    data_id: Option<&str>,
    now: i64,
) -> BillingResult<()> {
    // Parse the signature header: ts=timestamp,v1=signature
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "ts" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing ts in x-signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 in x-signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // Build the signed manifest. The id segment is lowercased per the
    // provider's template; segments for absent values are omitted.
    let mut manifest = String::new();
    if let Some(id) = data_id {
        manifest.push_str(&format!("id:{};", id.to_lowercase()));
    }
    if let Some(rid) = request_id {
        manifest.push_str(&format!("request-id:{};", rid));
    }
    manifest.push_str(&format!("ts:{};", timestamp));

    let expected = hex::decode(&v1_signature).map_err(|_| {
        tracing::warn!("v1 signature is not valid hex");
        BillingError::WebhookSignatureInvalid
    })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(manifest.as_bytes());

    // verify_slice is constant-time
    if mac.verify_slice(&expected).is_err() {
        tracing::warn!(
            received_sig = %v1_signature,
            "Webhook signature mismatch"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}
