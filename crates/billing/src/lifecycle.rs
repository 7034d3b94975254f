//! Subscription lifecycle actions
//!
//! Upgrades are always immediate and invoice the prorated difference right
//! away; downgrades are always deferred through a scheduled-downgrade row
//! that the reconciliation engine applies on renewal. Cycle switches reduce
//! to one or the other. Immediate cancellation is exactly-once through a
//! unique cancellation request row: a completed request replays its recorded
//! result without touching the provider, an incomplete one is re-claimed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClientInfo, PaymentAudit};
use crate::plans::{BillingInterval, PlanStore};
use crate::provider::{ProrationMode, ProviderRegistry, RefundParams};
use crate::subscriptions::{Subscription, SubscriptionStore};

/// Requested lifecycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upgrade,
    Downgrade,
    SwitchCycle,
}

#[derive(Debug, Clone)]
pub struct ChangeRequest {
    pub action: ChangeAction,
    pub plan_id: Option<i64>,
    pub interval: Option<BillingInterval>,
}

/// Outcome of a lifecycle change
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    /// "paid", "requires_action", "requires_payment_method" or "scheduled"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_invoice_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_price_id: Option<String>,
}

/// How to cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    AtPeriodEnd,
    Immediate,
}

/// Refund policy for immediate cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundMode {
    None,
    Full,
    Prorated,
}

impl RefundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Full => "full",
            Self::Prorated => "prorated",
        }
    }
}

/// Result of a cancellation. Immediate-cancel replays return the stored
/// result verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationResult {
    pub status: String,
    pub mode: String,
    pub refund_mode: String,
    pub refund_amount_cents: i64,
    pub refund_id: Option<String>,
    pub refund_error: Option<String>,
}

/// Prorated refund: amount paid scaled by the unused fraction of the
/// billing period, in whole seconds, clamped to [0, amount_paid].
pub fn prorated_refund_cents(
    amount_paid_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> i64 {
    let total_seconds = (period_end - period_start).whole_seconds();
    if total_seconds <= 0 {
        return 0;
    }
    let remaining_seconds = (period_end - now).whole_seconds().clamp(0, total_seconds);
    (amount_paid_cents * remaining_seconds / total_seconds).clamp(0, amount_paid_cents)
}

/// Refund idempotency key, derived from the refund identity
pub fn refund_idempotency_key(
    subscription_id: i64,
    invoice_id: Option<&str>,
    amount_cents: i64,
) -> String {
    format!(
        "cancel-{}-{}-{}",
        subscription_id,
        invoice_id.unwrap_or("none"),
        amount_cents
    )
}

#[derive(Clone)]
pub struct LifecycleService {
    pool: PgPool,
    registry: ProviderRegistry,
    plans: PlanStore,
    subscriptions: SubscriptionStore,
    audit: PaymentAudit,
}

impl LifecycleService {
    pub fn new(
        pool: PgPool,
        registry: ProviderRegistry,
        plans: PlanStore,
        subscriptions: SubscriptionStore,
        audit: PaymentAudit,
    ) -> Self {
        Self {
            pool,
            registry,
            plans,
            subscriptions,
            audit,
        }
    }

    pub async fn change(
        &self,
        actor_id: i64,
        request: ChangeRequest,
        client: &ClientInfo,
    ) -> BillingResult<ChangeOutcome> {
        let sub = self.subscriptions.require_for_actor(actor_id).await?;

        match request.action {
            ChangeAction::Upgrade => {
                let price_id = self.resolve_target_price(&sub, &request).await?;
                self.upgrade(&sub, &price_id, client).await
            }
            ChangeAction::Downgrade => {
                let price_id = self.resolve_target_price(&sub, &request).await?;
                self.schedule_downgrade(&sub, &price_id, client).await
            }
            ChangeAction::SwitchCycle => self.switch_cycle(&sub, &request, client).await,
        }
    }

    /// Target price for an explicit plan change request
    async fn resolve_target_price(
        &self,
        sub: &Subscription,
        request: &ChangeRequest,
    ) -> BillingResult<String> {
        let plan_id = request
            .plan_id
            .ok_or_else(|| BillingError::Validation("plan_id is required".to_string()))?;
        let plan = self.plans.by_id(plan_id).await?;

        let interval = request
            .interval
            .or_else(|| sub.interval.as_deref().and_then(BillingInterval::from_str))
            .unwrap_or_default();

        plan.price_id(&sub.provider, interval)
            .map(str::to_string)
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "plan '{}' has no {} price for provider '{}'",
                    plan.name, interval, sub.provider
                ))
            })
    }

    /// Immediate upgrade: swap the price with always-invoice proration and
    /// report how the generated invoice settled. The local row moves to the
    /// new plan right away instead of waiting for the webhook.
    async fn upgrade(
        &self,
        sub: &Subscription,
        price_id: &str,
        client: &ClientInfo,
    ) -> BillingResult<ChangeOutcome> {
        let provider = self.registry.get(&sub.provider)?;
        let updated = provider
            .modify_subscription(
                &sub.external_subscription_id,
                price_id,
                ProrationMode::AlwaysInvoice,
            )
            .await?;

        if let Some(plan) = self.plans.by_price_id(price_id).await? {
            let interval = plan.interval_for_price(price_id).map(|i| i.as_str());
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET plan_id = $2, "interval" = COALESCE($3, "interval"), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(sub.id)
            .bind(plan.id)
            .bind(interval)
            .execute(&self.pool)
            .await?;
        }

        self.audit
            .record(
                sub.user_id,
                "subscription.upgraded",
                None,
                json!({
                    "subscription_id": sub.id,
                    "target_price_id": price_id,
                    "provider": sub.provider,
                }),
                client,
            )
            .await;

        let invoice = updated.latest_invoice.unwrap_or_default();
        let outcome = if invoice.status.as_deref() == Some("paid") {
            ChangeOutcome {
                status: "paid".to_string(),
                hosted_invoice_url: None,
                client_secret: None,
                target_price_id: Some(price_id.to_string()),
            }
        } else if let Some(url) = invoice.hosted_invoice_url {
            ChangeOutcome {
                status: "requires_action".to_string(),
                hosted_invoice_url: Some(url),
                client_secret: None,
                target_price_id: Some(price_id.to_string()),
            }
        } else if let Some(secret) = invoice.payment_intent_client_secret {
            ChangeOutcome {
                status: "requires_payment_method".to_string(),
                hosted_invoice_url: None,
                client_secret: Some(secret),
                target_price_id: Some(price_id.to_string()),
            }
        } else {
            ChangeOutcome {
                status: "paid".to_string(),
                hosted_invoice_url: None,
                client_secret: None,
                target_price_id: Some(price_id.to_string()),
            }
        };

        tracing::info!(
            subscription_id = %sub.id,
            price_id = %price_id,
            status = %outcome.status,
            "Subscription upgraded"
        );

        Ok(outcome)
    }

    /// Deferred downgrade: one scheduled-downgrade row per subscription,
    /// applied by the reconciliation engine on the next renewal.
    async fn schedule_downgrade(
        &self,
        sub: &Subscription,
        price_id: &str,
        client: &ClientInfo,
    ) -> BillingResult<ChangeOutcome> {
        let organization_id = match sub.user_id {
            Some(user_id) => self.subscriptions.organization_of_user(user_id).await?,
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO scheduled_downgrades (subscription_id, organization_id, target_price_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id) DO UPDATE SET
                target_price_id = EXCLUDED.target_price_id,
                updated_at = NOW()
            "#,
        )
        .bind(sub.id)
        .bind(organization_id)
        .bind(price_id)
        .execute(&self.pool)
        .await?;

        self.audit
            .record(
                sub.user_id,
                "subscription.downgrade_scheduled",
                None,
                json!({
                    "subscription_id": sub.id,
                    "target_price_id": price_id,
                }),
                client,
            )
            .await;

        tracing::info!(
            subscription_id = %sub.id,
            target_price_id = %price_id,
            "Downgrade scheduled for next renewal"
        );

        Ok(ChangeOutcome {
            status: "scheduled".to_string(),
            hosted_invoice_url: None,
            client_secret: None,
            target_price_id: Some(price_id.to_string()),
        })
    }

    /// Cycle switches stay on the same plan: monthly -> yearly is an
    /// immediate upgrade, yearly -> monthly a deferred downgrade.
    async fn switch_cycle(
        &self,
        sub: &Subscription,
        request: &ChangeRequest,
        client: &ClientInfo,
    ) -> BillingResult<ChangeOutcome> {
        let plan_id = sub.plan_id.ok_or_else(|| {
            BillingError::InvalidCycleSwitch("subscription has no resolved plan".to_string())
        })?;
        if let Some(requested_plan) = request.plan_id {
            if requested_plan != plan_id {
                return Err(BillingError::InvalidCycleSwitch(
                    "requested price does not belong to the subscription's plan".to_string(),
                ));
            }
        }

        let requested = request.interval.ok_or_else(|| {
            BillingError::Validation("interval is required for a cycle switch".to_string())
        })?;
        let current = sub
            .interval
            .as_deref()
            .and_then(BillingInterval::from_str)
            .ok_or_else(|| {
                BillingError::InvalidCycleSwitch(
                    "subscription has no resolved billing interval".to_string(),
                )
            })?;

        if requested == current {
            return Err(BillingError::InvalidCycleSwitch(format!(
                "subscription already bills {current}"
            )));
        }

        let plan = self.plans.by_id(plan_id).await?;
        let price_id = plan
            .price_id(&sub.provider, requested)
            .map(str::to_string)
            .ok_or_else(|| {
                BillingError::InvalidCycleSwitch(format!(
                    "plan '{}' has no {} price for provider '{}'",
                    plan.name, requested, sub.provider
                ))
            })?;

        match requested {
            BillingInterval::Yearly => self.upgrade(sub, &price_id, client).await,
            BillingInterval::Monthly => self.schedule_downgrade(sub, &price_id, client).await,
        }
    }

    pub async fn cancel(
        &self,
        actor_id: i64,
        mode: CancelMode,
        refund_mode: RefundMode,
        client: &ClientInfo,
    ) -> BillingResult<CancellationResult> {
        let sub = self.subscriptions.require_for_actor(actor_id).await?;
        match mode {
            CancelMode::AtPeriodEnd => self.cancel_at_period_end(&sub, client).await,
            CancelMode::Immediate => self.cancel_immediate(&sub, refund_mode, client).await,
        }
    }

    /// Flag cancellation at period end. Idempotent: an already-flagged
    /// subscription is reported as success without a provider call.
    async fn cancel_at_period_end(
        &self,
        sub: &Subscription,
        client: &ClientInfo,
    ) -> BillingResult<CancellationResult> {
        if !sub.cancel_at_period_end {
            let provider = self.registry.get(&sub.provider)?;
            provider
                .cancel_subscription(&sub.external_subscription_id, true)
                .await?;

            sqlx::query(
                "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(sub.id)
            .execute(&self.pool)
            .await?;

            self.audit
                .record(
                    sub.user_id,
                    "subscription.cancel_scheduled",
                    None,
                    json!({ "subscription_id": sub.id }),
                    client,
                )
                .await;
        } else {
            tracing::info!(
                subscription_id = %sub.id,
                "Cancellation already flagged at period end"
            );
        }

        Ok(CancellationResult {
            status: "cancel_scheduled".to_string(),
            mode: "at_period_end".to_string(),
            refund_mode: RefundMode::None.as_str().to_string(),
            refund_amount_cents: 0,
            refund_id: None,
            refund_error: None,
        })
    }

    /// Immediate cancellation with optional refund. The unique
    /// (subscription, mode) request row makes this exactly-once: only a
    /// completed request is replayed from its recorded result. A request
    /// that failed before completion stays incomplete and is re-claimed by
    /// the next attempt, which calls the provider again.
    async fn cancel_immediate(
        &self,
        sub: &Subscription,
        refund_mode: RefundMode,
        client: &ClientInfo,
    ) -> BillingResult<CancellationResult> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO cancellation_requests (subscription_id, mode, refund_mode)
            VALUES ($1, 'immediate', $2)
            ON CONFLICT (subscription_id, mode) DO UPDATE
                SET refund_mode = EXCLUDED.refund_mode
                WHERE cancellation_requests.completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(sub.id)
        .bind(refund_mode.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((request_id,)) = claimed else {
            return self.stored_cancellation(sub.id).await;
        };

        // Size the refund before touching the provider subscription
        let provider = self.registry.get(&sub.provider)?;
        let charge = match provider
            .latest_paid_invoice(&sub.external_subscription_id)
            .await
        {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %e,
                    "Could not look up latest paid invoice, refund will be skipped"
                );
                None
            }
        };

        let now = OffsetDateTime::now_utc();
        let (mut refund_amount, payment_reference, invoice_id, currency) = match &charge {
            Some(charge) => {
                let amount = match refund_mode {
                    RefundMode::None => 0,
                    RefundMode::Full => charge.amount_paid_cents,
                    RefundMode::Prorated => match (charge.period_start, charge.period_end) {
                        (Some(start), Some(end)) => {
                            prorated_refund_cents(charge.amount_paid_cents, start, end, now)
                        }
                        _ => {
                            tracing::warn!(
                                subscription_id = %sub.id,
                                "Invoice has no billing period, prorated refund falls back to 0"
                            );
                            0
                        }
                    },
                };
                (
                    amount,
                    charge.payment_reference.clone(),
                    charge.invoice_id.clone(),
                    charge.currency.clone(),
                )
            }
            None => (0, None, None, None),
        };

        if refund_amount > 0 && payment_reference.is_none() {
            tracing::warn!(
                subscription_id = %sub.id,
                refund_mode = %refund_mode.as_str(),
                "No payment reference available, refund forced to 0"
            );
            refund_amount = 0;
        }

        provider
            .cancel_subscription(&sub.external_subscription_id, false)
            .await?;

        let mut refund_id = None;
        let mut refund_error = None;
        if refund_amount > 0 {
            // payment_reference is Some here, checked above
            if let Some(reference) = &payment_reference {
                let params = RefundParams {
                    payment_reference: reference.clone(),
                    amount_cents: refund_amount,
                    currency: currency.clone(),
                    idempotency_key: refund_idempotency_key(
                        sub.id,
                        invoice_id.as_deref(),
                        refund_amount,
                    ),
                    reason: "subscription_cancellation".to_string(),
                };
                match provider.issue_refund(&params).await {
                    Ok(refund) => refund_id = Some(refund.refund_id),
                    Err(e) => {
                        // Cancellation stands; record the divergence on the
                        // request row instead of rolling anything back.
                        tracing::error!(
                            subscription_id = %sub.id,
                            amount_cents = refund_amount,
                            error = %e,
                            "Subscription canceled but refund failed"
                        );
                        refund_error = Some(e.to_string());
                    }
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE cancellation_requests
            SET refund_amount_cents = $2, refund_currency = $3, refund_id = $4,
                refund_error = $5, external_invoice_id = $6, payment_reference = $7,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .bind(refund_amount)
        .bind(&currency)
        .bind(&refund_id)
        .bind(&refund_error)
        .bind(&invoice_id)
        .bind(&payment_reference)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', current_period_end = NOW(),
                cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        self.audit
            .record(
                sub.user_id,
                "subscription.canceled",
                None,
                json!({
                    "subscription_id": sub.id,
                    "refund_mode": refund_mode.as_str(),
                    "refund_amount_cents": refund_amount,
                    "refund_id": refund_id,
                }),
                client,
            )
            .await;

        tracing::info!(
            subscription_id = %sub.id,
            refund_amount_cents = refund_amount,
            "Subscription canceled immediately"
        );

        Ok(CancellationResult {
            status: "canceled".to_string(),
            mode: "immediate".to_string(),
            refund_mode: refund_mode.as_str().to_string(),
            refund_amount_cents: refund_amount,
            refund_id,
            refund_error,
        })
    }

    /// Recorded result of a previously completed immediate cancellation
    async fn stored_cancellation(&self, subscription_id: i64) -> BillingResult<CancellationResult> {
        let row: (String, Option<i64>, Option<String>, Option<String>) = sqlx::query_as(
            r#"
            SELECT refund_mode, refund_amount_cents, refund_id, refund_error
            FROM cancellation_requests
            WHERE subscription_id = $1 AND mode = 'immediate'
              AND completed_at IS NOT NULL
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            "Replayed immediate cancellation, returning recorded result"
        );

        Ok(CancellationResult {
            status: "canceled".to_string(),
            mode: "immediate".to_string(),
            refund_mode: row.0,
            refund_amount_cents: row.1.unwrap_or(0),
            refund_id: row.2,
            refund_error: row.3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn dt(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn halfway_through_period_refunds_half() {
        let start = dt(1_700_000_000);
        let end = start + Duration::days(30);
        let now = start + Duration::days(15);
        assert_eq!(prorated_refund_cents(10_000, start, end, now), 5_000);
    }

    #[test]
    fn expired_period_refunds_nothing() {
        let start = dt(1_700_000_000);
        let end = start + Duration::days(30);
        let now = end + Duration::days(1);
        assert_eq!(prorated_refund_cents(10_000, start, end, now), 0);
    }

    #[test]
    fn before_period_start_clamps_to_full_amount() {
        let start = dt(1_700_000_000);
        let end = start + Duration::days(30);
        let now = start - Duration::days(5);
        assert_eq!(prorated_refund_cents(10_000, start, end, now), 10_000);
    }

    #[test]
    fn zero_length_period_refunds_nothing() {
        let start = dt(1_700_000_000);
        assert_eq!(prorated_refund_cents(10_000, start, start, start), 0);
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        assert_eq!(
            refund_idempotency_key(7, Some("in_1"), 5000),
            "cancel-7-in_1-5000"
        );
        assert_eq!(refund_idempotency_key(7, None, 0), "cancel-7-none-0");
    }

    mod db {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use async_trait::async_trait;
        use serde_json::Value;
        use serial_test::serial;
        use uuid::Uuid;

        use super::super::*;
        use crate::provider::{
            CheckoutContext, CheckoutResult, InvoiceOutcome, PaymentProvider, ProviderCharge,
            ProviderRefund, ProviderSubscription,
        };

        /// Counts provider calls so replays can be proven side-effect free
        struct CountingProvider {
            cancels: AtomicUsize,
            refunds: AtomicUsize,
        }

        impl CountingProvider {
            fn new() -> Self {
                Self {
                    cancels: AtomicUsize::new(0),
                    refunds: AtomicUsize::new(0),
                }
            }
        }

        #[async_trait]
        impl PaymentProvider for CountingProvider {
            fn name(&self) -> &'static str {
                "paddle"
            }
            fn signature_header(&self) -> &'static str {
                "paddle-signature"
            }
            fn verify_webhook(&self, _signature: Option<&str>, _body: &str) -> BillingResult<()> {
                Ok(())
            }
            async fn create_checkout(
                &self,
                _ctx: &CheckoutContext,
            ) -> BillingResult<CheckoutResult> {
                Err(BillingError::Internal("not implemented".to_string()))
            }
            async fn modify_subscription(
                &self,
                external_id: &str,
                price_id: &str,
                _proration: ProrationMode,
            ) -> BillingResult<ProviderSubscription> {
                Ok(ProviderSubscription {
                    external_id: external_id.to_string(),
                    external_customer_id: None,
                    status: "active".to_string(),
                    cancel_at_period_end: false,
                    current_period_start: None,
                    current_period_end: None,
                    price_id: Some(price_id.to_string()),
                    latest_invoice: Some(InvoiceOutcome {
                        invoice_id: Some("inv_up_1".to_string()),
                        status: Some("paid".to_string()),
                        hosted_invoice_url: None,
                        payment_intent_client_secret: None,
                    }),
                })
            }
            async fn cancel_subscription(
                &self,
                external_id: &str,
                _at_period_end: bool,
            ) -> BillingResult<ProviderSubscription> {
                self.cancels.fetch_add(1, Ordering::SeqCst);
                Ok(ProviderSubscription {
                    external_id: external_id.to_string(),
                    external_customer_id: None,
                    status: "canceled".to_string(),
                    cancel_at_period_end: false,
                    current_period_start: None,
                    current_period_end: None,
                    price_id: None,
                    latest_invoice: None,
                })
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
                Ok(Some(ProviderCharge {
                    payment_reference: Some("txn_ref_1".to_string()),
                    invoice_id: Some("inv_1".to_string()),
                    amount_paid_cents: 10_000,
                    currency: Some("USD".to_string()),
                    period_start: None,
                    period_end: None,
                }))
            }
            async fn issue_refund(&self, params: &RefundParams) -> BillingResult<ProviderRefund> {
                self.refunds.fetch_add(1, Ordering::SeqCst);
                Ok(ProviderRefund {
                    refund_id: "ref_1".to_string(),
                    amount_cents: params.amount_cents,
                })
            }
            async fn fetch_transaction_detail(&self, _transaction_id: &str) -> Option<Value> {
                None
            }
            async fn fetch_invoice_pdf_url(&self, _transaction_id: &str) -> Option<String> {
                None
            }
        }

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn immediate_cancel_replay_returns_recorded_result_without_provider_calls() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = paysync_shared::create_pool(&url).await.expect("pool");
            paysync_shared::run_migrations(&pool).await.expect("migrations");

            let suffix = Uuid::new_v4().simple().to_string();
            let (actor_id,): (i64,) =
                sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
                    .bind(format!("cancel+{suffix}@example.com"))
                    .fetch_one(&pool)
                    .await
                    .expect("user");
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (user_id, provider, external_subscription_id, status)
                VALUES ($1, 'paddle', $2, 'active')
                "#,
            )
            .bind(actor_id)
            .bind(format!("psub_{suffix}"))
            .execute(&pool)
            .await
            .expect("subscription");

            let provider = Arc::new(CountingProvider::new());
            let mut registry = ProviderRegistry::new();
            registry.register(provider.clone());
            let service = LifecycleService::new(
                pool.clone(),
                registry,
                PlanStore::new(pool.clone()),
                SubscriptionStore::new(pool.clone()),
                PaymentAudit::new(pool.clone()),
            );

            let first = service
                .cancel(
                    actor_id,
                    CancelMode::Immediate,
                    RefundMode::Full,
                    &ClientInfo::default(),
                )
                .await
                .expect("first cancel");
            assert_eq!(first.status, "canceled");
            assert_eq!(first.refund_amount_cents, 10_000);
            assert_eq!(first.refund_id.as_deref(), Some("ref_1"));

            let replay = service
                .cancel(
                    actor_id,
                    CancelMode::Immediate,
                    RefundMode::Full,
                    &ClientInfo::default(),
                )
                .await
                .expect("replayed cancel");
            assert_eq!(replay, first);

            assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
            assert_eq!(provider.refunds.load(Ordering::SeqCst), 1);
        }

        /// Provider whose cancel fails once and then succeeds
        struct FlakyCancelProvider {
            cancels: AtomicUsize,
        }

        #[async_trait]
        impl PaymentProvider for FlakyCancelProvider {
            fn name(&self) -> &'static str {
                "paddle"
            }
            fn signature_header(&self) -> &'static str {
                "paddle-signature"
            }
            fn verify_webhook(&self, _signature: Option<&str>, _body: &str) -> BillingResult<()> {
                Ok(())
            }
            async fn create_checkout(
                &self,
                _ctx: &CheckoutContext,
            ) -> BillingResult<CheckoutResult> {
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
                external_id: &str,
                _at_period_end: bool,
            ) -> BillingResult<ProviderSubscription> {
                if self.cancels.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(BillingError::Provider {
                        provider: "paddle",
                        message: "service unavailable".to_string(),
                        status: Some(503),
                    });
                }
                Ok(ProviderSubscription {
                    external_id: external_id.to_string(),
                    external_customer_id: None,
                    status: "canceled".to_string(),
                    cancel_at_period_end: false,
                    current_period_start: None,
                    current_period_end: None,
                    price_id: None,
                    latest_invoice: None,
                })
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

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn failed_provider_cancel_does_not_fabricate_a_recorded_result() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = paysync_shared::create_pool(&url).await.expect("pool");
            paysync_shared::run_migrations(&pool).await.expect("migrations");

            let suffix = Uuid::new_v4().simple().to_string();
            let (actor_id,): (i64,) =
                sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
                    .bind(format!("flaky+{suffix}@example.com"))
                    .fetch_one(&pool)
                    .await
                    .expect("user");
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (user_id, provider, external_subscription_id, status)
                VALUES ($1, 'paddle', $2, 'active')
                "#,
            )
            .bind(actor_id)
            .bind(format!("psub_{suffix}"))
            .execute(&pool)
            .await
            .expect("subscription");

            let provider = Arc::new(FlakyCancelProvider {
                cancels: AtomicUsize::new(0),
            });
            let mut registry = ProviderRegistry::new();
            registry.register(provider.clone());
            let service = LifecycleService::new(
                pool.clone(),
                registry,
                PlanStore::new(pool.clone()),
                SubscriptionStore::new(pool.clone()),
                PaymentAudit::new(pool.clone()),
            );

            let first = service
                .cancel(
                    actor_id,
                    CancelMode::Immediate,
                    RefundMode::None,
                    &ClientInfo::default(),
                )
                .await;
            assert!(first.is_err());

            // The failed attempt must leave the subscription untouched
            let (status,): (String,) =
                sqlx::query_as("SELECT status FROM subscriptions WHERE user_id = $1")
                    .bind(actor_id)
                    .fetch_one(&pool)
                    .await
                    .expect("subscription row");
            assert_eq!(status, "active");

            // The retry re-claims the incomplete request and cancels for real
            let retry = service
                .cancel(
                    actor_id,
                    CancelMode::Immediate,
                    RefundMode::None,
                    &ClientInfo::default(),
                )
                .await
                .expect("retried cancel");
            assert_eq!(retry.status, "canceled");
            assert_eq!(provider.cancels.load(Ordering::SeqCst), 2);

            let (status,): (String,) =
                sqlx::query_as("SELECT status FROM subscriptions WHERE user_id = $1")
                    .bind(actor_id)
                    .fetch_one(&pool)
                    .await
                    .expect("subscription row");
            assert_eq!(status, "canceled");
        }

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn upgrade_moves_the_local_row_to_the_new_plan() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = paysync_shared::create_pool(&url).await.expect("pool");
            paysync_shared::run_migrations(&pool).await.expect("migrations");

            let suffix = Uuid::new_v4().simple().to_string();
            let (old_plan_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscription_plans (name, paddle_price_id_monthly, monthly_price_cents)
                VALUES ($1, $2, 1000)
                RETURNING id
                "#,
            )
            .bind(format!("starter_{suffix}"))
            .bind(format!("pri_old_{suffix}"))
            .fetch_one(&pool)
            .await
            .expect("old plan");
            let (new_plan_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscription_plans (name, paddle_price_id_monthly, monthly_price_cents)
                VALUES ($1, $2, 5000)
                RETURNING id
                "#,
            )
            .bind(format!("growth_{suffix}"))
            .bind(format!("pri_new_{suffix}"))
            .fetch_one(&pool)
            .await
            .expect("new plan");

            let (actor_id,): (i64,) =
                sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
                    .bind(format!("upgrade+{suffix}@example.com"))
                    .fetch_one(&pool)
                    .await
                    .expect("user");
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (user_id, provider, external_subscription_id, status, plan_id, "interval")
                VALUES ($1, 'paddle', $2, 'active', $3, 'monthly')
                "#,
            )
            .bind(actor_id)
            .bind(format!("psub_{suffix}"))
            .bind(old_plan_id)
            .execute(&pool)
            .await
            .expect("subscription");

            let mut registry = ProviderRegistry::new();
            registry.register(Arc::new(CountingProvider::new()));
            let service = LifecycleService::new(
                pool.clone(),
                registry,
                PlanStore::new(pool.clone()),
                SubscriptionStore::new(pool.clone()),
                PaymentAudit::new(pool.clone()),
            );

            let outcome = service
                .change(
                    actor_id,
                    ChangeRequest {
                        action: ChangeAction::Upgrade,
                        plan_id: Some(new_plan_id),
                        interval: Some(BillingInterval::Monthly),
                    },
                    &ClientInfo::default(),
                )
                .await
                .expect("upgrade");
            assert_eq!(outcome.status, "paid");

            let (plan_id, interval): (Option<i64>, Option<String>) = sqlx::query_as(
                r#"SELECT plan_id, "interval" FROM subscriptions WHERE user_id = $1"#,
            )
            .bind(actor_id)
            .fetch_one(&pool)
            .await
            .expect("subscription row");
            assert_eq!(plan_id, Some(new_plan_id));
            assert_eq!(interval.as_deref(), Some("monthly"));
        }
    }
}
