//! HTTP routes
//!
//! The webhook endpoint is ack-first: the only work done before responding
//! is signature verification plus one durable insert. Processing runs in a
//! spawned task after the 200 is on the wire; the worker's sweep picks up
//! anything that task does not finish.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use vitrina_billing::{BillingError, IngestOutcome};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/mercadopago", post(mercadopago_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded"})),
            )
                .into_response()
        }
    }
}

/// Receive a Mercado Pago webhook notification.
///
/// Status codes drive the provider's retry behavior:
/// - 200: stored (or already stored); provider must not redeliver
/// - 400/401: permanently rejected; redelivery would fail the same way
/// - 503: storage failed; provider should redeliver later
async fn mercadopago_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(signature) = header_str(&headers, "x-signature") else {
        tracing::warn!("Webhook rejected: missing x-signature header");
        return error_response(StatusCode::UNAUTHORIZED, "missing x-signature header");
    };
    let request_id = header_str(&headers, "x-request-id");

    match state
        .billing
        .webhooks
        .receive(&body, signature, request_id)
        .await
    {
        Ok(IngestOutcome::Accepted(event_id)) => {
            // Ack first; apply effects off the request path.
            let processor = state.billing.processor.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.process_by_id(event_id).await {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Inline webhook processing failed; sweep will retry"
                    );
                }
            });

            Json(json!({"status": "accepted"})).into_response()
        }
        Ok(IngestOutcome::Duplicate) => Json(json!({"status": "duplicate"})).into_response(),
        Err(BillingError::WebhookSignatureInvalid) => {
            error_response(StatusCode::UNAUTHORIZED, "invalid signature")
        }
        Err(BillingError::InvalidPayload(reason)) => {
            tracing::warn!(reason = %reason, "Webhook rejected: malformed payload");
            error_response(StatusCode::BAD_REQUEST, "malformed payload")
        }
        Err(e) if e.is_retryable() => {
            tracing::error!(error = %e, "Webhook storage failed; asking provider to retry");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook ingestion failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
