//! Provider webhook endpoint
//!
//! One endpoint per provider, dispatched by path. Order of operations is
//! fixed: signature verification against the raw body, normalization,
//! idempotency claim in the event ledger, then reconciliation. Once the
//! ledger row exists the delivery is acknowledged with 200 even when
//! reconciliation fails, so the provider does not retry an event we have
//! already claimed; recovery is by operator replay.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use paysync_billing::{normalize, LedgerOutcome, NormalizeError};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/:provider
pub async fn receive(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let provider = state.billing.registry.get(&provider_name)?;

    let signature = headers
        .get(provider.signature_header())
        .and_then(|v| v.to_str().ok());
    provider.verify_webhook(signature, &body)?;

    let payload: Value = serde_json::from_str(&body)
        .map_err(|_| ApiError::BadRequest("Webhook payload is not valid JSON".to_string()))?;

    let event = normalize(&provider_name, &payload).map_err(|e| match e {
        NormalizeError::MissingEventId | NormalizeError::MissingEventType => {
            ApiError::BadRequest(e.to_string())
        }
        NormalizeError::Malformed(msg) => ApiError::BadRequest(msg.to_string()),
    })?;

    let outcome = state
        .billing
        .ledger
        .record_event_once(&provider_name, &event.event_id, &event.raw)
        .await?;

    if outcome == LedgerOutcome::AlreadyProcessed {
        return Ok(Json(json!({ "status": "already_processed" })));
    }

    if let Err(e) = state.billing.engine.process(&event).await {
        tracing::error!(
            event_id = %event.event_id,
            provider = %provider_name,
            error = %e,
            "Event reconciliation failed after ledger claim"
        );
    }

    // Paddle expects "ok", Stripe-style providers "success"
    let ack = match provider_name.as_str() {
        "paddle" => "ok",
        _ => "success",
    };
    Ok(Json(json!({ "status": ack })))
}
