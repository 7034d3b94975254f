//! Stripe-compatible provider
//!
//! Uses the async-stripe SDK for API calls and manual HMAC verification for
//! webhook signatures (the `t=<ts>,v1=<hex>` scheme signed over
//! `"{t}.{body}"`, 5 minute tolerance).

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateRefund, Expandable, Invoice, Refund,
    RefundReasonFilter, Subscription, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use crate::config::StripeSettings;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutContext, CheckoutResult, InvoiceOutcome, PaymentProvider, ProrationMode,
    ProviderCharge, ProviderRefund, ProviderSubscription, RefundParams,
};

type HmacSha256 = Hmac<Sha256>;

/// Seconds of clock skew tolerated on webhook timestamps
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeProvider {
    client: stripe::Client,
    webhook_secret: String,
}

impl StripeProvider {
    pub fn new(settings: &StripeSettings) -> Self {
        Self {
            client: stripe::Client::new(&settings.secret_key),
            webhook_secret: settings.webhook_secret.clone(),
        }
    }

    fn map_provider_sub(subscription: &Subscription) -> ProviderSubscription {
        let external_customer_id = Some(match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        });

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        ProviderSubscription {
            external_id: subscription.id.to_string(),
            external_customer_id,
            status: subscription.status.to_string(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .ok(),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            price_id,
            latest_invoice: None,
        }
    }

    /// Resolve the latest invoice of a subscription into a payment outcome,
    /// expanding the payment intent for its client secret.
    async fn invoice_outcome(&self, subscription: &Subscription) -> Option<InvoiceOutcome> {
        let invoice_id = match subscription.latest_invoice.as_ref()? {
            Expandable::Id(id) => id.clone(),
            Expandable::Object(invoice) => invoice.id.clone(),
        };

        let invoice = match Invoice::retrieve(&self.client, &invoice_id, &["payment_intent"]).await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Failed to retrieve latest invoice after subscription change"
                );
                return None;
            }
        };

        let client_secret = invoice.payment_intent.as_ref().and_then(|pi| match pi {
            Expandable::Object(intent) => intent.client_secret.clone(),
            Expandable::Id(_) => None,
        });

        Some(InvoiceOutcome {
            invoice_id: Some(invoice.id.to_string()),
            status: invoice.status.map(|s| s.to_string()),
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            payment_intent_client_secret: client_secret,
        })
    }
}

fn is_card_decline(message: &str) -> bool {
    message.contains("card_declined") || message.contains("card was declined")
}

fn is_already_canceled(message: &str) -> bool {
    message.contains("No such subscription")
        || message.contains("already been canceled")
        || message.contains("canceled subscription")
}

/// Parse a `t=<ts>,v1=<hex>[,v0=...]` signature header
pub(crate) fn parse_signature_header(header: &str) -> (Option<i64>, Option<String>) {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].trim().parse().ok(),
                "v1" => v1_signature = Some(kv[1].trim().to_string()),
                _ => {}
            }
        }
    }

    (timestamp, v1_signature)
}

pub(crate) fn verify_signed_payload(
    secret: &str,
    timestamp: i64,
    body: &str,
    candidate_hex: &str,
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

    // The secret may carry a "whsec_" prefix
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, body);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());

    let candidate =
        hex::decode(candidate_hex).map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.verify_slice(&candidate)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    fn verify_webhook(&self, signature: Option<&str>, body: &str) -> BillingResult<()> {
        let header = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
        let (timestamp, v1) = parse_signature_header(header);
        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1 = v1.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signed_payload(&self.webhook_secret, timestamp, body, &v1, now)
    }

    async fn create_checkout(&self, ctx: &CheckoutContext) -> BillingResult<CheckoutResult> {
        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(ctx.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }];

        let mut metadata: HashMap<String, String> = ctx.metadata.clone();
        metadata.insert("actor_id".to_string(), ctx.actor_id.to_string());
        metadata.insert("plan_name".to_string(), ctx.plan_name.clone());

        let params = CreateCheckoutSession {
            customer_email: Some(&ctx.actor_email),
            client_reference_id: Some(&ctx.idempotency_key),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&ctx.success_url),
            cancel_url: Some(&ctx.cancel_url),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client, params).await?;
        let raw_session = serde_json::to_value(&session)?;

        Ok(CheckoutResult {
            session_id: session.id.to_string(),
            checkout_url: session.url.clone(),
            raw_session,
        })
    }

    async fn modify_subscription(
        &self,
        external_id: &str,
        price_id: &str,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = external_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {e}")))?;

        let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let proration_behavior = match proration {
            ProrationMode::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
            ProrationMode::None => SubscriptionProrationBehavior::None,
        };

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(proration_behavior),
            ..Default::default()
        };

        let subscription = Subscription::update(&self.client, &sub_id, params)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_card_decline(&message) {
                    return BillingError::CardDeclined(message);
                }
                if message.contains("no attached payment source")
                    || message.contains("no default payment method")
                {
                    return BillingError::PaymentMethodRequired;
                }
                BillingError::StripeApi(message)
            })?;

        let mut mapped = Self::map_provider_sub(&subscription);
        if proration == ProrationMode::AlwaysInvoice {
            mapped.latest_invoice = self.invoice_outcome(&subscription).await;
        }
        Ok(mapped)
    }

    async fn cancel_subscription(
        &self,
        external_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = external_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {e}")))?;

        if at_period_end {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            let subscription = Subscription::update(&self.client, &sub_id, params).await?;
            return Ok(Self::map_provider_sub(&subscription));
        }

        match Subscription::cancel(&self.client, &sub_id, CancelSubscription::default()).await {
            Ok(subscription) => Ok(Self::map_provider_sub(&subscription)),
            Err(e) => {
                let message = e.to_string();
                if is_already_canceled(&message) {
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
                } else {
                    Err(BillingError::StripeApi(message))
                }
            }
        }
    }

    async fn retrieve_subscription(
        &self,
        external_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = external_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {e}")))?;
        let subscription = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(Self::map_provider_sub(&subscription))
    }

    async fn latest_paid_invoice(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<ProviderCharge>> {
        let mut params = stripe::ListInvoices::new();
        params.subscription = Some(external_subscription_id.parse().map_err(|e| {
            BillingError::RefundFailed(format!("Invalid subscription id: {e}"))
        })?);
        params.status = Some(stripe::InvoiceStatus::Paid);
        params.limit = Some(1);

        let invoices = Invoice::list(&self.client, &params).await?;
        let invoice = match invoices.data.into_iter().next() {
            Some(invoice) => invoice,
            None => return Ok(None),
        };

        let payment_reference = invoice.charge.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(charge) => charge.id.to_string(),
        });

        Ok(Some(ProviderCharge {
            payment_reference,
            invoice_id: Some(invoice.id.to_string()),
            amount_paid_cents: invoice.amount_paid.unwrap_or(0),
            currency: invoice.currency.map(|c| c.to_string()),
            period_start: invoice
                .period_start
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            period_end: invoice
                .period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        }))
    }

    async fn issue_refund(&self, params: &RefundParams) -> BillingResult<ProviderRefund> {
        let mut create = CreateRefund::new();
        create.charge = Some(
            params
                .payment_reference
                .parse()
                .map_err(|e| BillingError::RefundFailed(format!("Invalid charge id: {e}")))?,
        );
        create.amount = Some(params.amount_cents);
        create.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), params.reason.clone());
        create.metadata = Some(metadata);

        // The key rides the Idempotency-Key header so the API itself
        // deduplicates retried refund requests
        let client = self
            .client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(
                params.idempotency_key.clone(),
            ));
        let refund = Refund::create(&client, create)
            .await
            .map_err(|e| BillingError::RefundFailed(e.to_string()))?;

        Ok(ProviderRefund {
            refund_id: refund.id.to_string(),
            amount_cents: params.amount_cents,
        })
    }

    async fn fetch_transaction_detail(&self, transaction_id: &str) -> Option<Value> {
        let invoice_id = transaction_id.parse().ok()?;
        match Invoice::retrieve(&self.client, &invoice_id, &[]).await {
            Ok(invoice) => serde_json::to_value(&invoice).ok(),
            Err(e) => {
                tracing::warn!(
                    invoice_id = %transaction_id,
                    error = %e,
                    "Failed to fetch invoice detail"
                );
                None
            }
        }
    }

    async fn fetch_invoice_pdf_url(&self, transaction_id: &str) -> Option<String> {
        let invoice_id = transaction_id.parse().ok()?;
        match Invoice::retrieve(&self.client, &invoice_id, &[]).await {
            Ok(invoice) => invoice.invoice_pdf,
            Err(e) => {
                tracing::warn!(
                    invoice_id = %transaction_id,
                    error = %e,
                    "Failed to fetch invoice PDF URL"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn parses_signature_header_parts() {
        let (ts, v1) = parse_signature_header("t=1700000000,v1=abc123,v0=ignored");
        assert_eq!(ts, Some(1700000000));
        assert_eq!(v1.as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_parts_yield_none() {
        let (ts, v1) = parse_signature_header("v1=abc");
        assert_eq!(ts, None);
        assert_eq!(v1.as_deref(), Some("abc"));
    }

    #[test]
    fn valid_signature_verifies() {
        let body = r#"{"id":"evt_1"}"#;
        let ts = 1_700_000_000;
        let sig = sign("test_secret", ts, body);
        assert!(verify_signed_payload("test_secret", ts, body, &sig, ts + 10).is_ok());
    }

    #[test]
    fn whsec_prefix_is_stripped() {
        let body = "{}";
        let ts = 1_700_000_000;
        let sig = sign("test_secret", ts, body);
        assert!(verify_signed_payload("whsec_test_secret", ts, body, &sig, ts).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = "{}";
        let ts = 1_700_000_000;
        let sig = sign("test_secret", ts, body);
        assert!(verify_signed_payload("test_secret", ts, body, &sig, ts + 301).is_err());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let ts = 1_700_000_000;
        let sig = sign("other_secret", ts, "{}");
        assert!(verify_signed_payload("test_secret", ts, "{}", &sig, ts).is_err());
    }

    #[test]
    fn card_decline_detection() {
        assert!(is_card_decline("Your card was declined."));
        assert!(is_card_decline("code: card_declined"));
        assert!(!is_card_decline("insufficient permissions"));
    }

    #[tokio::test]
    async fn refund_request_carries_idempotency_key_header() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/refunds")
            .match_header("idempotency-key", "cancel-7-in_1-5000")
            .with_status(200)
            .with_body(
                r#"{"id":"re_1","object":"refund","amount":5000,"created":1700000000,"currency":"usd","metadata":{},"status":"succeeded"}"#,
            )
            .create_async()
            .await;

        let provider = StripeProvider {
            client: stripe::Client::from_url(server.url().as_str(), "sk_test_key"),
            webhook_secret: "whsec_test".to_string(),
        };

        let refund = provider
            .issue_refund(&RefundParams {
                payment_reference: "ch_1".to_string(),
                amount_cents: 5000,
                currency: Some("usd".to_string()),
                idempotency_key: "cancel-7-in_1-5000".to_string(),
                reason: "subscription_cancellation".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(refund.refund_id, "re_1");
        assert_eq!(refund.amount_cents, 5000);
    }
}
