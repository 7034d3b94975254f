//! Paddle-compatible provider
//!
//! Plain REST client over reqwest (the SDK situation for this provider is
//! thin, and the webhook surface only needs a handful of endpoints).
//! Webhook signatures use the `ts=<unix>;h1=<hex>[;h1=...]` scheme:
//! HMAC-SHA256 over `"{ts}:{raw_body}"`, 5 minute tolerance, any `h1`
//! candidate may match.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::PaddleSettings;
use crate::error::{BillingError, BillingResult};
use crate::normalize::to_cents;
use crate::provider::{
    CheckoutContext, CheckoutResult, PaymentProvider, ProrationMode, ProviderCharge,
    ProviderRefund, ProviderSubscription, RefundParams,
};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct PaddleProvider {
    http: reqwest::Client,
    api_key: String,
    webhook_secret: String,
    base_url: String,
}

impl PaddleProvider {
    pub fn new(settings: &PaddleSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: settings.api_key.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn api_get(&self, path: &str) -> BillingResult<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn api_send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &Value,
    ) -> BillingResult<Value> {
        let response = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> BillingResult<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .pointer("/error/detail")
                .or_else(|| body.pointer("/error/code"))
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(BillingError::Provider {
                provider: "paddle",
                message,
                status: Some(status.as_u16()),
            });
        }
        Ok(body)
    }

    fn map_provider_sub(data: &Value) -> ProviderSubscription {
        let parse_ts = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        };

        let cancel_at_period_end = data
            .pointer("/scheduled_change/action")
            .and_then(Value::as_str)
            .map(|action| action == "cancel")
            .unwrap_or(false);

        ProviderSubscription {
            external_id: data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            external_customer_id: data
                .get("customer_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            cancel_at_period_end,
            current_period_start: parse_ts(data.pointer("/current_billing_period/starts_at")),
            current_period_end: parse_ts(data.pointer("/current_billing_period/ends_at")),
            price_id: data
                .pointer("/items/0/price/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            latest_invoice: None,
        }
    }
}

/// Parse a `ts=<unix>;h1=<hex>[;h1=...]` signature header.
/// Multiple h1 entries appear during secret rotation.
pub(crate) fn parse_signature_header(header: &str) -> (Option<i64>, Vec<String>) {
    let mut ts: Option<i64> = None;
    let mut candidates = Vec::new();

    for part in header.split(';') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "ts" => ts = kv[1].trim().parse().ok(),
                "h1" => candidates.push(kv[1].trim().to_string()),
                _ => {}
            }
        }
    }

    (ts, candidates)
}

pub(crate) fn verify_signed_payload(
    secret: &str,
    timestamp: i64,
    body: &str,
    candidates: &[String],
    now_unix: i64,
) -> BillingResult<()> {
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}:{}", timestamp, body);
    for candidate in candidates {
        let Ok(candidate_bytes) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Err(BillingError::WebhookSignatureInvalid),
        };
        mac.update(signed_payload.as_bytes());
        // Mac::verify_slice compares in constant time
        if mac.verify_slice(&candidate_bytes).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}

#[async_trait]
impl PaymentProvider for PaddleProvider {
    fn name(&self) -> &'static str {
        "paddle"
    }

    fn signature_header(&self) -> &'static str {
        "paddle-signature"
    }

    fn verify_webhook(&self, signature: Option<&str>, body: &str) -> BillingResult<()> {
        let header = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
        let (ts, candidates) = parse_signature_header(header);
        let ts = ts.ok_or(BillingError::WebhookSignatureInvalid)?;
        if candidates.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signed_payload(&self.webhook_secret, ts, body, &candidates, now)
    }

    async fn create_checkout(&self, ctx: &CheckoutContext) -> BillingResult<CheckoutResult> {
        let address = ctx.billing_address.as_ref().ok_or_else(|| {
            BillingError::Validation("billing address required for paddle checkout".to_string())
        })?;

        let custom_data: Value = ctx
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let body = json!({
            "items": [{ "price_id": ctx.price_id, "quantity": 1 }],
            "custom_data": custom_data,
            "customer": {
                "email": ctx.actor_email,
                "address": {
                    "country_code": address.country_code,
                    "postal_code": address.postal_code,
                }
            },
        });

        let response = self
            .api_send(reqwest::Method::POST, "/transactions", &body)
            .await?;
        let data = response.get("data").cloned().unwrap_or(Value::Null);

        let session_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::Provider {
                provider: "paddle",
                message: "transaction response missing id".to_string(),
                status: None,
            })?
            .to_string();

        let checkout_url = data
            .pointer("/checkout/url")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(CheckoutResult {
            session_id,
            checkout_url,
            raw_session: data,
        })
    }

    async fn modify_subscription(
        &self,
        external_id: &str,
        price_id: &str,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription> {
        let proration_billing_mode = match proration {
            ProrationMode::AlwaysInvoice => "prorated_immediately",
            ProrationMode::None => "do_not_bill",
        };

        let body = json!({
            "items": [{ "price_id": price_id, "quantity": 1 }],
            "proration_billing_mode": proration_billing_mode,
        });

        let response = self
            .api_send(
                reqwest::Method::PATCH,
                &format!("/subscriptions/{external_id}"),
                &body,
            )
            .await
            .map_err(|e| match e {
                BillingError::Provider {
                    message, status, ..
                } if message.contains("declined") => BillingError::CardDeclined(format!(
                    "paddle payment declined ({}): {message}",
                    status.unwrap_or(0)
                )),
                other => other,
            })?;

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::map_provider_sub(&data))
    }

    async fn cancel_subscription(
        &self,
        external_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let effective_from = if at_period_end {
            "next_billing_period"
        } else {
            "immediately"
        };
        let body = json!({ "effective_from": effective_from });

        match self
            .api_send(
                reqwest::Method::POST,
                &format!("/subscriptions/{external_id}/cancel"),
                &body,
            )
            .await
        {
            Ok(response) => {
                let data = response.get("data").cloned().unwrap_or(Value::Null);
                Ok(Self::map_provider_sub(&data))
            }
            Err(BillingError::Provider { message, .. }) if message.contains("canceled") => {
                tracing::info!(
                    subscription_id = %external_id,
                    "Subscription already canceled upstream, treating as success"
                );
                Ok(ProviderSubscription {
                    external_id: external_id.to_string(),
                    external_customer_id: None,
                    status: "canceled".to_string(),
                    cancel_at_period_end: false,
                    current_period_start: None,
                    current_period_end: Some(OffsetDateTime::now_utc()),
                    price_id: None,
                    latest_invoice: None,
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn retrieve_subscription(
        &self,
        external_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let response = self
            .api_get(&format!("/subscriptions/{external_id}"))
            .await?;
        let data = response.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::map_provider_sub(&data))
    }

    async fn latest_paid_invoice(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<ProviderCharge>> {
        let response = self
            .api_get(&format!(
                "/transactions?subscription_id={external_subscription_id}&status=completed&per_page=1"
            ))
            .await?;

        let Some(tx) = response.pointer("/data/0") else {
            return Ok(None);
        };

        let parse_ts = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        };

        let tx_id = tx.get("id").and_then(Value::as_str).map(str::to_string);
        let amount_paid_cents = tx
            .pointer("/details/totals/grand_total")
            .map(to_cents)
            .unwrap_or(0);

        Ok(Some(ProviderCharge {
            // Paddle refunds adjust the transaction itself
            payment_reference: tx_id.clone(),
            invoice_id: tx_id,
            amount_paid_cents,
            currency: tx
                .get("currency_code")
                .and_then(Value::as_str)
                .map(str::to_string),
            period_start: parse_ts(tx.pointer("/billing_period/starts_at")),
            period_end: parse_ts(tx.pointer("/billing_period/ends_at")),
        }))
    }

    async fn issue_refund(&self, params: &RefundParams) -> BillingResult<ProviderRefund> {
        // Adjustments are itemized, so the refund amount has to be pinned to
        // a transaction line item. Without it the adjustment would refund
        // the whole transaction regardless of the computed proration.
        let detail = self
            .api_get(&format!("/transactions/{}", params.payment_reference))
            .await
            .map_err(|e| BillingError::RefundFailed(e.to_string()))?;
        let item_id = detail
            .pointer("/data/details/line_items/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BillingError::RefundFailed("transaction has no line items to adjust".to_string())
            })?;

        let body = json!({
            "action": "refund",
            "transaction_id": params.payment_reference,
            "reason": params.reason,
            "items": [{
                "item_id": item_id,
                "type": "partial",
                "amount": params.amount_cents.to_string(),
            }],
            "custom_data": { "idempotency_key": params.idempotency_key },
        });

        let response = self
            .api_send(reqwest::Method::POST, "/adjustments", &body)
            .await
            .map_err(|e| BillingError::RefundFailed(e.to_string()))?;

        let refund_id = response
            .pointer("/data/id")
            .and_then(Value::as_str)
            .unwrap_or("adj_unknown")
            .to_string();

        Ok(ProviderRefund {
            refund_id,
            amount_cents: params.amount_cents,
        })
    }

    async fn fetch_transaction_detail(&self, transaction_id: &str) -> Option<Value> {
        match self.api_get(&format!("/transactions/{transaction_id}")).await {
            Ok(response) => response.get("data").cloned(),
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Failed to fetch transaction detail"
                );
                None
            }
        }
    }

    async fn fetch_invoice_pdf_url(&self, transaction_id: &str) -> Option<String> {
        match self
            .api_get(&format!(
                "/transactions/{transaction_id}/invoice?disposition=inline"
            ))
            .await
        {
            Ok(response) => response
                .pointer("/data/url")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Failed to fetch invoice PDF URL"
                );
                None
            }
        }
    }
}
