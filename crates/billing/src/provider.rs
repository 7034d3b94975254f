//! Payment provider abstraction
//!
//! One object-safe trait covers every provider operation the backend needs;
//! concrete providers live in [`crate::providers`]. Services never name a
//! concrete provider type, they resolve one through [`ProviderRegistry`] by
//! the provider name stored on the subscription row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::tax::TaxBreakdown;

/// Proration behavior for subscription modifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationMode {
    /// Invoice the prorated difference immediately (upgrades)
    AlwaysInvoice,
    /// No proration (scheduled downgrade application)
    None,
}

/// Billing address attached to a checkout
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct BillingAddress {
    pub country_code: String,
    pub postal_code: String,
}

/// Everything a provider needs to create a checkout session
#[derive(Debug, Clone)]
pub struct CheckoutContext {
    pub actor_id: i64,
    pub actor_email: String,
    pub price_id: String,
    pub plan_name: String,
    pub tax: TaxBreakdown,
    pub currency: String,
    pub idempotency_key: String,
    pub success_url: String,
    pub cancel_url: String,
    pub billing_address: Option<BillingAddress>,
    pub metadata: HashMap<String, String>,
}

/// Result of creating a checkout session
#[derive(Debug, Clone)]
pub struct CheckoutResult {
    pub session_id: String,
    pub checkout_url: Option<String>,
    pub raw_session: Value,
}

/// Outcome of the invoice generated by a subscription modification
#[derive(Debug, Clone, Default)]
pub struct InvoiceOutcome {
    pub invoice_id: Option<String>,
    pub status: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub payment_intent_client_secret: Option<String>,
}

/// Provider-side view of a subscription
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub external_id: String,
    pub external_customer_id: Option<String>,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub price_id: Option<String>,
    pub latest_invoice: Option<InvoiceOutcome>,
}

/// The most recent settled payment on a subscription, used to size refunds
#[derive(Debug, Clone)]
pub struct ProviderCharge {
    /// Provider payment reference (charge id / transaction id). May be
    /// absent, in which case refunds are forced to zero.
    pub payment_reference: Option<String>,
    pub invoice_id: Option<String>,
    pub amount_paid_cents: i64,
    pub currency: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

/// Parameters for issuing a refund
#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_reference: String,
    pub amount_cents: i64,
    pub currency: Option<String>,
    /// Derived from (subscription id, invoice id, amount); replays with the
    /// same key must not double-refund.
    pub idempotency_key: String,
    pub reason: String,
}

/// A refund acknowledged by the provider
#[derive(Debug, Clone)]
pub struct ProviderRefund {
    pub refund_id: String,
    pub amount_cents: i64,
}

/// Uniform interface over external payment providers
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Stable provider name ("stripe", "paddle"); keys the registry and the
    /// provider column on subscriptions
    fn name(&self) -> &'static str;

    /// HTTP header carrying this provider's webhook signature
    fn signature_header(&self) -> &'static str;

    /// Verify a webhook signature against the raw request body
    fn verify_webhook(&self, signature: Option<&str>, body: &str) -> BillingResult<()>;

    async fn create_checkout(&self, ctx: &CheckoutContext) -> BillingResult<CheckoutResult>;

    /// Swap the subscription onto a new price
    async fn modify_subscription(
        &self,
        external_id: &str,
        price_id: &str,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription>;

    /// Cancel now or flag cancellation at period end. An upstream
    /// "already canceled" condition is reported as success.
    async fn cancel_subscription(
        &self,
        external_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription>;

    async fn retrieve_subscription(&self, external_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Most recent settled payment for a subscription, if any
    async fn latest_paid_invoice(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<ProviderCharge>>;

    async fn issue_refund(&self, params: &RefundParams) -> BillingResult<ProviderRefund>;

    /// Full transaction detail for invoice enrichment. Best-effort: any
    /// failure returns None.
    async fn fetch_transaction_detail(&self, transaction_id: &str) -> Option<Value>;

    /// Hosted PDF URL for a transaction's invoice. Best-effort.
    async fn fetch_invoice_pdf_url(&self, transaction_id: &str) -> Option<String>;
}

/// Registry of configured providers, keyed by name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| BillingError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait]
    impl PaymentProvider for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }
        fn signature_header(&self) -> &'static str {
            "x-null-signature"
        }
        fn verify_webhook(&self, _signature: Option<&str>, _body: &str) -> BillingResult<()> {
            Ok(())
        }
        async fn create_checkout(&self, _ctx: &CheckoutContext) -> BillingResult<CheckoutResult> {
            Err(BillingError::Internal("not implemented".to_string()))
        }
        async fn modify_subscription(
            &self,
            _external_id: &str,
            _price_id: &str,
            _proration: ProrationMode,
        ) -> BillingResult<ProviderSubscription> {
            Err(BillingError::Internal("not implemented".to_string()))
        }
        async fn cancel_subscription(
            &self,
            _external_id: &str,
            _at_period_end: bool,
        ) -> BillingResult<ProviderSubscription> {
            Err(BillingError::Internal("not implemented".to_string()))
        }
        async fn retrieve_subscription(
            &self,
            _external_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            Err(BillingError::Internal("not implemented".to_string()))
        }
        async fn latest_paid_invoice(
            &self,
            _external_subscription_id: &str,
        ) -> BillingResult<Option<ProviderCharge>> {
            Ok(None)
        }
        async fn issue_refund(&self, _params: &RefundParams) -> BillingResult<ProviderRefund> {
            Err(BillingError::Internal("not implemented".to_string()))
        }
        async fn fetch_transaction_detail(&self, _transaction_id: &str) -> Option<Value> {
            None
        }
        async fn fetch_invoice_pdf_url(&self, _transaction_id: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(NullProvider));
        assert!(registry.get("null").is_ok());
        assert!(matches!(
            registry.get("square"),
            Err(BillingError::UnknownProvider(_))
        ));
    }
}
