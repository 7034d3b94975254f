//! Subscription reconciliation engine
//!
//! Drives local state toward provider truth from normalized webhook events.
//! Dispatch is a match over [`EventKind`]; each handler splits into small
//! recoverable steps (plan resolution, usage reset, org linking, enrichment,
//! notifications) that log their own failures without aborting the rest.
//! Only the primary upsert propagates errors to the caller.
//!
//! Ordering guarantees live in the SQL: the subscription upsert never lets a
//! status regress (rank table below) and never nulls a populated field, so
//! out-of-order and partial events converge instead of fighting.

use serde_json::{json, Value};
use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClientInfo, PaymentAudit};
use crate::normalize::{to_cents, EventKind, NormalizedEvent};
use crate::notify::{NotificationClient, PaymentNotice};
use crate::plans::{Plan, PlanStore};
use crate::provider::{ProrationMode, ProviderRegistry};
use crate::subscriptions::{Subscription, SubscriptionStore};
use crate::tax::derive_from_totals;
use crate::usage::UsageService;

/// Rank table for status non-regression. Terminal statuses (canceled,
/// inactive) are outside the ranking and always apply.
fn status_rank(status: &str) -> i32 {
    match status {
        "pending" => 0,
        "trialing" => 1,
        "past_due" => 2,
        _ => 3,
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "canceled" | "inactive")
}

/// Whether an incoming status may replace the stored one. Mirrors the CASE
/// expression inside the upsert SQL. Terminal statuses are sticky: once a
/// subscription is canceled or inactive, only another terminal status may
/// replace it. A late event never resurrects a dead subscription.
pub fn status_applies(current: &str, incoming: &str) -> bool {
    if is_terminal(incoming) {
        return true;
    }
    if is_terminal(current) {
        return false;
    }
    status_rank(incoming) >= status_rank(current)
}

/// Fields a subscription event may carry. Absent fields never overwrite
/// stored values.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub status: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub quantity: Option<i32>,
    pub price_id: Option<String>,
}

fn unix_ts(subject: &Value, field: &str) -> Option<OffsetDateTime> {
    subject
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

fn rfc3339_ts(value: Option<&Value>) -> Option<OffsetDateTime> {
    value
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

/// Extract the subscription patch from a provider event subject
pub fn extract_patch(provider: &str, subject: &Value) -> SubscriptionPatch {
    match provider {
        "paddle" => SubscriptionPatch {
            status: subject
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            cancel_at_period_end: subject
                .pointer("/scheduled_change/action")
                .and_then(Value::as_str)
                .map(|action| action == "cancel"),
            current_period_start: rfc3339_ts(subject.pointer("/current_billing_period/starts_at")),
            current_period_end: rfc3339_ts(subject.pointer("/current_billing_period/ends_at")),
            trial_end: rfc3339_ts(subject.pointer("/trial_dates/ends_at")),
            quantity: subject
                .pointer("/items/0/quantity")
                .and_then(Value::as_i64)
                .map(|q| q as i32),
            price_id: subject
                .pointer("/items/0/price/id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => SubscriptionPatch {
            status: subject
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            cancel_at_period_end: subject.get("cancel_at_period_end").and_then(Value::as_bool),
            current_period_start: unix_ts(subject, "current_period_start"),
            current_period_end: unix_ts(subject, "current_period_end"),
            trial_end: unix_ts(subject, "trial_end"),
            quantity: subject
                .get("quantity")
                .and_then(Value::as_i64)
                .map(|q| q as i32),
            price_id: subject
                .pointer("/items/data/0/price/id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    }
}

/// Invoice fields extracted from a payment event. Absent fields stay None
/// so the coalesce upsert never overwrites populated values.
#[derive(Debug, Clone, Default)]
pub struct InvoicePatch {
    pub external_invoice_id: Option<String>,
    pub amount_due_cents: Option<i64>,
    pub amount_paid_cents: Option<i64>,
    pub currency: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub subtotal_cents: Option<i64>,
    pub tax_cents: Option<i64>,
}

/// Extract invoice fields from a payment event subject
pub fn extract_invoice(provider: &str, subject: &Value) -> InvoicePatch {
    match provider {
        "paddle" => {
            let totals = subject.pointer("/details/totals").cloned().unwrap_or(Value::Null);
            InvoicePatch {
                external_invoice_id: subject
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                amount_due_cents: totals.get("grand_total").map(to_cents),
                amount_paid_cents: totals.get("grand_total").map(to_cents),
                currency: subject
                    .get("currency_code")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                hosted_invoice_url: None,
                invoice_pdf_url: None,
                period_start: rfc3339_ts(subject.pointer("/billing_period/starts_at")),
                period_end: rfc3339_ts(subject.pointer("/billing_period/ends_at")),
                subtotal_cents: totals.get("subtotal").map(to_cents),
                tax_cents: totals.get("tax").map(to_cents),
            }
        }
        _ => InvoicePatch {
            external_invoice_id: subject
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            amount_due_cents: subject.get("amount_due").map(to_cents),
            amount_paid_cents: subject.get("amount_paid").map(to_cents),
            currency: subject
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            hosted_invoice_url: subject
                .get("hosted_invoice_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            invoice_pdf_url: subject
                .get("invoice_pdf")
                .and_then(Value::as_str)
                .map(str::to_string),
            period_start: unix_ts(subject, "period_start"),
            period_end: unix_ts(subject, "period_end"),
            subtotal_cents: subject.get("subtotal").map(to_cents),
            tax_cents: subject.get("tax").map(to_cents),
        },
    }
}

pub struct ReconciliationEngine {
    pool: PgPool,
    registry: ProviderRegistry,
    plans: PlanStore,
    subscriptions: SubscriptionStore,
    usage: UsageService,
    notifier: NotificationClient,
    audit: PaymentAudit,
    fallback_billing_contact_id: i64,
}

impl ReconciliationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        registry: ProviderRegistry,
        plans: PlanStore,
        subscriptions: SubscriptionStore,
        usage: UsageService,
        notifier: NotificationClient,
        audit: PaymentAudit,
        fallback_billing_contact_id: i64,
    ) -> Self {
        Self {
            pool,
            registry,
            plans,
            subscriptions,
            usage,
            notifier,
            audit,
            fallback_billing_contact_id,
        }
    }

    /// Process a normalized event. Called after the ledger has recorded the
    /// event; errors here are logged by the webhook endpoint, which still
    /// acknowledges the delivery.
    pub async fn process(&self, event: &NormalizedEvent) -> BillingResult<()> {
        match &event.kind {
            EventKind::CheckoutCompleted => self.handle_checkout_completed(event).await,
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_event(event).await
            }
            EventKind::SubscriptionCanceled => self.handle_subscription_canceled(event).await,
            EventKind::InvoicePaid | EventKind::TransactionCompleted => {
                self.handle_payment_succeeded(event).await
            }
            EventKind::PaymentFailed => self.handle_payment_failed(event).await,
            EventKind::Unknown(event_type) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    "Ignoring unhandled event type"
                );
                Ok(())
            }
        }
    }

    /// Most recent checkout whose recorded session matches the provider
    /// customer id. This is how webhook events recover the local actor.
    async fn resolve_actor(&self, external_customer_id: Option<&str>) -> Option<i64> {
        let customer_id = external_customer_id?;
        let row: Result<Option<(Option<i64>,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT actor_id FROM checkout_records
            WHERE raw_session->>'customer' = $1
               OR raw_session->>'customer_id' = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.and_then(|(actor_id,)| actor_id),
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Actor resolution from checkout records failed"
                );
                None
            }
        }
    }

    /// Insert a pending skeleton row so invoice data has somewhere to hang
    /// when it arrives before the subscription event. DO NOTHING on
    /// conflict: never disturbs an existing row.
    async fn ensure_subscription_exists(
        &self,
        provider: &str,
        external_subscription_id: &str,
        actor_id: Option<i64>,
        external_customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let billing_contact = actor_id.unwrap_or(self.fallback_billing_contact_id);
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, billing_contact_user_id, provider, external_subscription_id,
                 external_customer_id, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (provider, external_subscription_id) DO NOTHING
            "#,
        )
        .bind(actor_id)
        .bind(billing_contact)
        .bind(provider)
        .bind(external_subscription_id)
        .bind(external_customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full-field upsert with status non-regression and COALESCE semantics.
    /// Returns (row id, user id).
    async fn upsert_subscription(
        &self,
        provider: &str,
        external_subscription_id: &str,
        external_customer_id: Option<&str>,
        actor_id: Option<i64>,
        plan: Option<&Plan>,
        interval: Option<&str>,
        patch: &SubscriptionPatch,
    ) -> BillingResult<(i64, Option<i64>)> {
        let billing_contact = actor_id.unwrap_or(self.fallback_billing_contact_id);
        let status = patch.status.as_deref().unwrap_or("pending");

        let row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, billing_contact_user_id, plan_id, provider,
                 external_subscription_id, external_customer_id, status,
                 current_period_start, current_period_end, cancel_at_period_end,
                 trial_end, quantity, "interval")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (provider, external_subscription_id) DO UPDATE SET
                user_id = COALESCE(subscriptions.user_id, EXCLUDED.user_id),
                billing_contact_user_id = COALESCE(subscriptions.billing_contact_user_id, EXCLUDED.billing_contact_user_id),
                plan_id = COALESCE(EXCLUDED.plan_id, subscriptions.plan_id),
                external_customer_id = COALESCE(EXCLUDED.external_customer_id, subscriptions.external_customer_id),
                status = CASE
                    WHEN EXCLUDED.status IN ('canceled', 'inactive') THEN EXCLUDED.status
                    WHEN subscriptions.status IN ('canceled', 'inactive') THEN subscriptions.status
                    WHEN (CASE EXCLUDED.status WHEN 'pending' THEN 0 WHEN 'trialing' THEN 1 WHEN 'past_due' THEN 2 ELSE 3 END)
                      >= (CASE subscriptions.status WHEN 'pending' THEN 0 WHEN 'trialing' THEN 1 WHEN 'past_due' THEN 2 ELSE 3 END)
                        THEN EXCLUDED.status
                    ELSE subscriptions.status
                END,
                current_period_start = COALESCE(EXCLUDED.current_period_start, subscriptions.current_period_start),
                current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                cancel_at_period_end = CASE WHEN $14 THEN EXCLUDED.cancel_at_period_end ELSE subscriptions.cancel_at_period_end END,
                trial_end = COALESCE(EXCLUDED.trial_end, subscriptions.trial_end),
                quantity = CASE WHEN $15 THEN EXCLUDED.quantity ELSE subscriptions.quantity END,
                "interval" = COALESCE(EXCLUDED."interval", subscriptions."interval"),
                updated_at = NOW()
            RETURNING id, user_id
            "#,
        )
        .bind(actor_id)
        .bind(billing_contact)
        .bind(plan.map(|p| p.id))
        .bind(provider)
        .bind(external_subscription_id)
        .bind(external_customer_id)
        .bind(status)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end.unwrap_or(false))
        .bind(patch.trial_end)
        .bind(patch.quantity.unwrap_or(1))
        .bind(interval)
        .bind(patch.cancel_at_period_end.is_some())
        .bind(patch.quantity.is_some())
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn handle_checkout_completed(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let session_id = event
            .subject
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BillingError::MalformedPayload("checkout event has no session id".to_string())
            })?;

        let actor: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            UPDATE checkout_records
            SET status = 'completed', raw_session = $2, updated_at = NOW()
            WHERE session_id = $1
            RETURNING actor_id
            "#,
        )
        .bind(session_id)
        .bind(&event.subject)
        .fetch_optional(&self.pool)
        .await?;

        let actor_id = actor.and_then(|(id,)| id);
        if actor.is_none() {
            tracing::warn!(
                session_id = %session_id,
                "Checkout completion for unknown session"
            );
        }

        if let Some(external_sub) = event.external_subscription_id.as_deref() {
            self.ensure_subscription_exists(
                &event.provider,
                external_sub,
                actor_id,
                event.external_customer_id.as_deref(),
            )
            .await?;
        }

        self.audit
            .record(
                actor_id,
                "checkout.completed",
                Some(session_id),
                json!({ "provider": event.provider }),
                &ClientInfo::default(),
            )
            .await;

        tracing::info!(
            session_id = %session_id,
            actor_id = ?actor_id,
            "Checkout session completed"
        );
        Ok(())
    }

    async fn handle_subscription_event(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let Some(external_sub) = event.external_subscription_id.as_deref() else {
            tracing::warn!(event_id = %event.event_id, "Subscription event without subscription id");
            return Ok(());
        };

        let patch = extract_patch(&event.provider, &event.subject);
        let actor_id = self
            .resolve_actor(event.external_customer_id.as_deref())
            .await;

        // Old plan limits, for the usage reset decision after the upsert
        let old_plan = match self
            .subscriptions
            .by_external(&event.provider, external_sub)
            .await
        {
            Ok(existing) => match existing.and_then(|s| s.plan_id) {
                Some(plan_id) => self.plans.by_id(plan_id).await.ok(),
                None => None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Could not load existing subscription before upsert");
                None
            }
        };

        // Plan resolution by external price id
        let (new_plan, interval) = match patch.price_id.as_deref() {
            Some(price_id) => match self.plans.by_price_id(price_id).await {
                Ok(Some(plan)) => {
                    let interval = plan.interval_for_price(price_id).map(|i| i.as_str());
                    (Some(plan), interval)
                }
                Ok(None) => {
                    tracing::warn!(
                        price_id = %price_id,
                        "No plan matches event price id, leaving plan untouched"
                    );
                    (None, None)
                }
                Err(e) => {
                    tracing::warn!(price_id = %price_id, error = %e, "Plan resolution failed");
                    (None, None)
                }
            },
            None => (None, None),
        };

        let (sub_id, user_id) = self
            .upsert_subscription(
                &event.provider,
                external_sub,
                event.external_customer_id.as_deref(),
                actor_id,
                new_plan.as_ref(),
                interval,
                &patch,
            )
            .await?;

        // Post-upsert steps are individually recoverable
        if let Some(user_id) = user_id {
            if let Err(e) = self.deactivate_other_subscriptions(user_id, sub_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Deactivating old subscriptions failed");
            }

            match self.subscriptions.organization_of_user(user_id).await {
                Ok(Some(org_id)) => {
                    if let Err(e) = self.link_organization(org_id, sub_id).await {
                        tracing::warn!(org_id = %org_id, error = %e, "Linking organization to subscription failed");
                    }
                    if let Some(plan) = &new_plan {
                        if let Err(e) = self
                            .usage
                            .reset_expanded_counters(
                                org_id,
                                old_plan.as_ref(),
                                plan,
                                patch.current_period_end,
                            )
                            .await
                        {
                            tracing::warn!(org_id = %org_id, error = %e, "Usage counter reset failed");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Organization lookup failed");
                }
            }
        }

        if event.kind == EventKind::SubscriptionUpdated {
            if let Err(e) = self.apply_scheduled_downgrade(&event.provider, external_sub).await {
                tracing::warn!(
                    subscription = %external_sub,
                    error = %e,
                    "Scheduled downgrade application failed"
                );
            }
        }

        tracing::info!(
            subscription_id = %sub_id,
            external_id = %external_sub,
            status = ?patch.status,
            "Subscription reconciled"
        );
        Ok(())
    }

    async fn handle_subscription_canceled(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let Some(external_sub) = event.external_subscription_id.as_deref() else {
            tracing::warn!(event_id = %event.event_id, "Cancellation event without subscription id");
            return Ok(());
        };

        let mut patch = extract_patch(&event.provider, &event.subject);
        patch.status = Some("canceled".to_string());
        if patch.current_period_end.is_none() {
            patch.current_period_end = Some(OffsetDateTime::now_utc());
        }

        let actor_id = self
            .resolve_actor(event.external_customer_id.as_deref())
            .await;

        let (sub_id, _) = self
            .upsert_subscription(
                &event.provider,
                external_sub,
                event.external_customer_id.as_deref(),
                actor_id,
                None,
                None,
                &patch,
            )
            .await?;

        tracing::info!(
            subscription_id = %sub_id,
            external_id = %external_sub,
            "Subscription canceled by provider"
        );
        Ok(())
    }

    async fn handle_payment_succeeded(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let invoice = extract_invoice(&event.provider, &event.subject);
        let Some(external_invoice_id) = invoice.external_invoice_id.clone() else {
            return Err(BillingError::MalformedPayload(
                "payment event has no transaction id".to_string(),
            ));
        };

        // Invoice may precede the subscription row; make sure one exists
        let mut local_sub: Option<Subscription> = None;
        if let Some(external_sub) = event.external_subscription_id.as_deref() {
            let actor_id = self
                .resolve_actor(event.external_customer_id.as_deref())
                .await;
            self.ensure_subscription_exists(
                &event.provider,
                external_sub,
                actor_id,
                event.external_customer_id.as_deref(),
            )
            .await?;
            local_sub = self
                .subscriptions
                .by_external(&event.provider, external_sub)
                .await?;
        }

        self.upsert_invoice(event, &invoice, local_sub.as_ref(), "paid")
            .await?;

        // Best-effort enrichment and notification
        if let Err(e) = self
            .enrich_invoice_urls(&event.provider, &external_invoice_id, &invoice)
            .await
        {
            tracing::warn!(
                invoice_id = %external_invoice_id,
                error = %e,
                "Invoice URL enrichment failed"
            );
        }

        self.notify_payment(true, &invoice, local_sub.as_ref(), "paid")
            .await;

        // A successful renewal is the moment scheduled downgrades apply
        if let Some(external_sub) = event.external_subscription_id.as_deref() {
            if let Err(e) = self.apply_scheduled_downgrade(&event.provider, external_sub).await {
                tracing::warn!(
                    subscription = %external_sub,
                    error = %e,
                    "Scheduled downgrade application failed"
                );
            }
        }

        tracing::info!(
            invoice_id = %external_invoice_id,
            amount_paid_cents = ?invoice.amount_paid_cents,
            "Payment recorded"
        );
        Ok(())
    }

    async fn handle_payment_failed(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let invoice = extract_invoice(&event.provider, &event.subject);
        if invoice.external_invoice_id.is_none() {
            tracing::warn!(event_id = %event.event_id, "Payment failure without transaction id");
            return Ok(());
        }

        let mut local_sub = None;
        if let Some(external_sub) = event.external_subscription_id.as_deref() {
            local_sub = self
                .subscriptions
                .by_external(&event.provider, external_sub)
                .await?;
        }

        self.upsert_invoice(event, &invoice, local_sub.as_ref(), "failed")
            .await?;
        self.notify_payment(false, &invoice, local_sub.as_ref(), "failed")
            .await;

        tracing::info!(
            invoice_id = ?invoice.external_invoice_id,
            "Payment failure recorded"
        );
        Ok(())
    }

    /// Invoice coalesce upsert keyed on the external transaction id. The
    /// incoming event wins the status unless the invoice already settled as
    /// paid; a stale failure event never regresses a paid invoice. Every
    /// other field keeps populated values.
    async fn upsert_invoice(
        &self,
        event: &NormalizedEvent,
        invoice: &InvoicePatch,
        local_sub: Option<&Subscription>,
        status: &str,
    ) -> BillingResult<()> {
        let (subtotal, rate_percent) = match (invoice.subtotal_cents, invoice.amount_due_cents) {
            (Some(subtotal), _) => {
                let tax = invoice.tax_cents.unwrap_or(0);
                let rate = if subtotal > 0 {
                    (tax as f64) / (subtotal as f64) * 100.0
                } else {
                    0.0
                };
                (Some(subtotal), Some(rate))
            }
            (None, Some(due)) => {
                let (subtotal, rate) = derive_from_totals(due, invoice.tax_cents.unwrap_or(0));
                (Some(subtotal), Some(rate))
            }
            (None, None) => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO invoices
                (user_id, subscription_id, provider, external_invoice_id,
                 amount_due_cents, amount_paid_cents, currency, invoice_pdf_url,
                 hosted_invoice_url, status, period_start, period_end,
                 subtotal_cents, tax_cents, total_cents, tax_rate_percent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (external_invoice_id) DO UPDATE SET
                user_id = COALESCE(invoices.user_id, EXCLUDED.user_id),
                subscription_id = COALESCE(invoices.subscription_id, EXCLUDED.subscription_id),
                amount_due_cents = COALESCE(EXCLUDED.amount_due_cents, invoices.amount_due_cents),
                amount_paid_cents = COALESCE(EXCLUDED.amount_paid_cents, invoices.amount_paid_cents),
                currency = COALESCE(EXCLUDED.currency, invoices.currency),
                invoice_pdf_url = COALESCE(EXCLUDED.invoice_pdf_url, invoices.invoice_pdf_url),
                hosted_invoice_url = COALESCE(EXCLUDED.hosted_invoice_url, invoices.hosted_invoice_url),
                status = CASE
                    WHEN invoices.status = 'paid' THEN invoices.status
                    ELSE EXCLUDED.status
                END,
                period_start = COALESCE(EXCLUDED.period_start, invoices.period_start),
                period_end = COALESCE(EXCLUDED.period_end, invoices.period_end),
                subtotal_cents = COALESCE(EXCLUDED.subtotal_cents, invoices.subtotal_cents),
                tax_cents = COALESCE(EXCLUDED.tax_cents, invoices.tax_cents),
                total_cents = COALESCE(EXCLUDED.total_cents, invoices.total_cents),
                tax_rate_percent = COALESCE(EXCLUDED.tax_rate_percent, invoices.tax_rate_percent)
            "#,
        )
        .bind(local_sub.and_then(|s| s.user_id))
        .bind(local_sub.map(|s| s.id))
        .bind(&event.provider)
        .bind(&invoice.external_invoice_id)
        .bind(invoice.amount_due_cents)
        .bind(invoice.amount_paid_cents)
        .bind(&invoice.currency)
        .bind(&invoice.invoice_pdf_url)
        .bind(&invoice.hosted_invoice_url)
        .bind(status)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(subtotal)
        .bind(invoice.tax_cents)
        .bind(invoice.amount_due_cents)
        .bind(rate_percent)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fill in missing hosted/PDF URLs from the provider after the fact
    async fn enrich_invoice_urls(
        &self,
        provider_name: &str,
        external_invoice_id: &str,
        invoice: &InvoicePatch,
    ) -> BillingResult<()> {
        if invoice.invoice_pdf_url.is_some() && invoice.hosted_invoice_url.is_some() {
            return Ok(());
        }

        let provider = self.registry.get(provider_name)?;

        let pdf_url = if invoice.invoice_pdf_url.is_none() {
            provider.fetch_invoice_pdf_url(external_invoice_id).await
        } else {
            None
        };

        let hosted_url = if invoice.hosted_invoice_url.is_none() {
            provider
                .fetch_transaction_detail(external_invoice_id)
                .await
                .and_then(|detail| {
                    detail
                        .pointer("/checkout/url")
                        .or_else(|| detail.pointer("/hosted_invoice_url"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
        } else {
            None
        };

        if pdf_url.is_none() && hosted_url.is_none() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE invoices
            SET invoice_pdf_url = COALESCE($2, invoice_pdf_url),
                hosted_invoice_url = COALESCE($3, hosted_invoice_url)
            WHERE external_invoice_id = $1
            "#,
        )
        .bind(external_invoice_id)
        .bind(pdf_url)
        .bind(hosted_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn notify_payment(
        &self,
        success: bool,
        invoice: &InvoicePatch,
        local_sub: Option<&Subscription>,
        status: &str,
    ) {
        let mut organization_id = None;
        let mut plan_name = None;

        if let Some(sub) = local_sub {
            if let Some(user_id) = sub.user_id {
                organization_id = self
                    .subscriptions
                    .organization_of_user(user_id)
                    .await
                    .ok()
                    .flatten();
            }
            if let Some(plan_id) = sub.plan_id {
                plan_name = self.plans.by_id(plan_id).await.ok().map(|p| p.name);
            }
        }

        self.notifier
            .notify_payment(
                success,
                &PaymentNotice {
                    organization_id,
                    amount_cents: if success {
                        invoice.amount_paid_cents.unwrap_or(0)
                    } else {
                        invoice.amount_due_cents.unwrap_or(0)
                    },
                    currency: invoice.currency.clone(),
                    plan_name,
                    invoice_url: invoice
                        .hosted_invoice_url
                        .clone()
                        .or_else(|| invoice.invoice_pdf_url.clone()),
                    status: status.to_string(),
                },
            )
            .await;
    }

    async fn deactivate_other_subscriptions(
        &self,
        user_id: i64,
        current_subscription_id: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'inactive', updated_at = NOW()
            WHERE user_id = $1 AND id != $2 AND status NOT IN ('inactive', 'canceled')
            "#,
        )
        .bind(user_id)
        .bind(current_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_organization(
        &self,
        organization_id: i64,
        subscription_id: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE organizations SET subscription_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(organization_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a pending scheduled downgrade on renewal. Only fires for an
    /// active subscription that is not flagged for cancellation; a flagged
    /// one keeps its pending downgrade untouched.
    async fn apply_scheduled_downgrade(
        &self,
        provider_name: &str,
        external_subscription_id: &str,
    ) -> BillingResult<()> {
        let Some(sub) = self
            .subscriptions
            .by_external(provider_name, external_subscription_id)
            .await?
        else {
            return Ok(());
        };

        let pending: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, target_price_id FROM scheduled_downgrades WHERE subscription_id = $1",
        )
        .bind(sub.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((downgrade_id, target_price_id)) = pending else {
            return Ok(());
        };

        if sub.status != "active" || sub.cancel_at_period_end {
            tracing::info!(
                subscription_id = %sub.id,
                status = %sub.status,
                cancel_at_period_end = sub.cancel_at_period_end,
                "Leaving scheduled downgrade pending"
            );
            return Ok(());
        }

        let provider = self.registry.get(provider_name)?;
        provider
            .modify_subscription(external_subscription_id, &target_price_id, ProrationMode::None)
            .await?;

        sqlx::query("DELETE FROM scheduled_downgrades WHERE id = $1")
            .bind(downgrade_id)
            .execute(&self.pool)
            .await?;

        // Reflect the new plan locally without waiting for the next webhook
        if let Ok(Some(plan)) = self.plans.by_price_id(&target_price_id).await {
            let interval = plan.interval_for_price(&target_price_id).map(|i| i.as_str());
            sqlx::query(
                r#"UPDATE subscriptions SET plan_id = $2, "interval" = COALESCE($3, "interval"), updated_at = NOW() WHERE id = $1"#,
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
                "subscription.downgrade_applied",
                None,
                json!({
                    "subscription_id": sub.id,
                    "target_price_id": target_price_id,
                }),
                &ClientInfo::default(),
            )
            .await;

        tracing::info!(
            subscription_id = %sub.id,
            target_price_id = %target_price_id,
            "Scheduled downgrade applied on renewal"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn active_never_regresses_to_pending_or_trialing() {
        assert!(!status_applies("active", "pending"));
        assert!(!status_applies("active", "trialing"));
        assert!(status_applies("active", "active"));
        assert!(!status_applies("active", "past_due"));
    }

    #[test]
    fn forward_transitions_apply() {
        assert!(status_applies("pending", "trialing"));
        assert!(status_applies("pending", "active"));
        assert!(status_applies("trialing", "active"));
        assert!(status_applies("past_due", "active"));
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        assert!(status_applies("active", "canceled"));
        assert!(status_applies("trialing", "inactive"));
        assert!(status_applies("canceled", "inactive"));
        assert!(!status_applies("canceled", "active"));
        assert!(!status_applies("canceled", "pending"));
        assert!(!status_applies("inactive", "trialing"));
    }

    #[test]
    fn stripe_patch_extraction() {
        let subject = json!({
            "id": "sub_1",
            "status": "active",
            "cancel_at_period_end": true,
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "quantity": 3,
            "items": { "data": [ { "price": { "id": "price_m" } } ] }
        });
        let patch = extract_patch("stripe", &subject);
        assert_eq!(patch.status.as_deref(), Some("active"));
        assert_eq!(patch.cancel_at_period_end, Some(true));
        assert_eq!(patch.quantity, Some(3));
        assert_eq!(patch.price_id.as_deref(), Some("price_m"));
        assert!(patch.current_period_start.is_some());
    }

    #[test]
    fn paddle_patch_extraction() {
        let subject = json!({
            "id": "sub_p1",
            "status": "active",
            "scheduled_change": { "action": "cancel" },
            "current_billing_period": {
                "starts_at": "2026-01-01T00:00:00Z",
                "ends_at": "2026-02-01T00:00:00Z"
            },
            "items": [ { "quantity": 1, "price": { "id": "pri_y" } } ]
        });
        let patch = extract_patch("paddle", &subject);
        assert_eq!(patch.cancel_at_period_end, Some(true));
        assert_eq!(patch.price_id.as_deref(), Some("pri_y"));
        assert!(patch.current_period_end.is_some());
    }

    #[test]
    fn absent_fields_stay_none() {
        let patch = extract_patch("stripe", &json!({ "id": "sub_1" }));
        assert!(patch.status.is_none());
        assert!(patch.cancel_at_period_end.is_none());
        assert!(patch.quantity.is_none());
    }

    #[test]
    fn stripe_invoice_extraction_with_tax_derivation() {
        let subject = json!({
            "id": "in_1",
            "amount_due": 10200,
            "amount_paid": 10200,
            "currency": "usd",
            "tax": 200,
            "hosted_invoice_url": "https://pay.example/i/in_1"
        });
        let invoice = extract_invoice("stripe", &subject);
        assert_eq!(invoice.amount_due_cents, Some(10200));
        assert_eq!(invoice.tax_cents, Some(200));
        assert!(invoice.subtotal_cents.is_none());
        let (subtotal, rate) = derive_from_totals(10200, 200);
        assert_eq!(subtotal, 10000);
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn paddle_invoice_extraction_parses_string_money() {
        let subject = json!({
            "id": "txn_1",
            "currency_code": "EUR",
            "details": { "totals": { "subtotal": "1000", "tax": "20", "grand_total": "1020" } },
            "billing_period": {
                "starts_at": "2026-01-01T00:00:00Z",
                "ends_at": "2026-02-01T00:00:00Z"
            }
        });
        let invoice = extract_invoice("paddle", &subject);
        assert_eq!(invoice.amount_due_cents, Some(1020));
        assert_eq!(invoice.subtotal_cents, Some(1000));
        assert_eq!(invoice.tax_cents, Some(20));
        assert_eq!(invoice.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn sparse_payment_event_extracts_no_amounts() {
        let invoice = extract_invoice("stripe", &json!({ "id": "in_2" }));
        assert!(invoice.amount_due_cents.is_none());
        assert!(invoice.amount_paid_cents.is_none());
        assert!(invoice.tax_cents.is_none());
        assert!(invoice.subtotal_cents.is_none());
    }

    mod db {
        use super::super::*;
        use std::sync::Arc;

        use async_trait::async_trait;
        use serde_json::json;
        use serial_test::serial;
        use uuid::Uuid;

        use crate::provider::{
            CheckoutContext, CheckoutResult, PaymentProvider, ProviderCharge, ProviderRefund,
            ProviderSubscription, RefundParams,
        };

        async fn test_pool() -> PgPool {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = paysync_shared::create_pool(&url).await.expect("pool");
            paysync_shared::run_migrations(&pool).await.expect("migrations");
            pool
        }

        fn test_engine(pool: &PgPool, registry: ProviderRegistry) -> ReconciliationEngine {
            ReconciliationEngine::new(
                pool.clone(),
                registry,
                PlanStore::new(pool.clone()),
                SubscriptionStore::new(pool.clone()),
                UsageService::new(pool.clone()),
                NotificationClient::new(None),
                PaymentAudit::new(pool.clone()),
                42,
            )
        }

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn payment_before_subscription_creates_skeleton_and_paid_status_is_final() {
            let pool = test_pool().await;
            let engine = test_engine(&pool, ProviderRegistry::new());

            let suffix = Uuid::new_v4().simple().to_string();
            let sub_id = format!("psub_{suffix}");
            let txn_id = format!("ptxn_{suffix}");

            let paid = NormalizedEvent {
                event_id: format!("evt_paid_{suffix}"),
                kind: EventKind::TransactionCompleted,
                provider: "paddle".to_string(),
                subject: json!({
                    "id": txn_id,
                    "subscription_id": sub_id,
                    "customer_id": format!("ctm_{suffix}"),
                    "currency_code": "USD",
                    "details": {
                        "totals": { "subtotal": "1000", "tax": "20", "grand_total": "1020" }
                    }
                }),
                external_subscription_id: Some(sub_id.clone()),
                external_customer_id: Some(format!("ctm_{suffix}")),
                raw: json!({}),
            };
            engine.process(&paid).await.expect("payment event");

            let (status, user_id, contact): (String, Option<i64>, Option<i64>) = sqlx::query_as(
                r#"
                SELECT status, user_id, billing_contact_user_id FROM subscriptions
                WHERE provider = 'paddle' AND external_subscription_id = $1
                "#,
            )
            .bind(&sub_id)
            .fetch_one(&pool)
            .await
            .expect("skeleton row");
            assert_eq!(status, "pending");
            assert_eq!(user_id, None);
            assert_eq!(contact, Some(42));

            // A stale failure event with no totals must neither blank the
            // amounts nor regress the settled paid status
            let failed = NormalizedEvent {
                event_id: format!("evt_failed_{suffix}"),
                kind: EventKind::PaymentFailed,
                provider: "paddle".to_string(),
                subject: json!({ "id": txn_id, "subscription_id": sub_id }),
                external_subscription_id: Some(sub_id.clone()),
                external_customer_id: None,
                raw: json!({}),
            };
            engine.process(&failed).await.expect("failure event");

            let (inv_status, paid_cents, subtotal): (Option<String>, Option<i64>, Option<i64>) =
                sqlx::query_as(
                    r#"
                    SELECT status, amount_paid_cents, subtotal_cents FROM invoices
                    WHERE external_invoice_id = $1
                    "#,
                )
                .bind(&txn_id)
                .fetch_one(&pool)
                .await
                .expect("invoice row");
            assert_eq!(inv_status.as_deref(), Some("paid"));
            assert_eq!(paid_cents, Some(1020));
            assert_eq!(subtotal, Some(1000));
        }

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn checkout_record_links_actor_to_later_subscription_events() {
            let pool = test_pool().await;
            let engine = test_engine(&pool, ProviderRegistry::new());

            let suffix = Uuid::new_v4().simple().to_string();
            let customer = format!("ctm_{suffix}");
            let sub_id = format!("psub_{suffix}");

            let (actor_id,): (i64,) =
                sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
                    .bind(format!("buyer+{suffix}@example.com"))
                    .fetch_one(&pool)
                    .await
                    .expect("user");
            sqlx::query(
                r#"
                INSERT INTO checkout_records
                    (actor_id, provider, session_id, idempotency_key, raw_session, status)
                VALUES ($1, 'paddle', $2, $3, $4, 'completed')
                "#,
            )
            .bind(actor_id)
            .bind(format!("cs_{suffix}"))
            .bind(Uuid::new_v4())
            .bind(json!({ "customer_id": customer }))
            .execute(&pool)
            .await
            .expect("checkout record");

            let event = NormalizedEvent {
                event_id: format!("evt_sub_{suffix}"),
                kind: EventKind::SubscriptionCreated,
                provider: "paddle".to_string(),
                subject: json!({
                    "id": sub_id,
                    "status": "active",
                    "customer_id": customer,
                    "current_billing_period": {
                        "starts_at": "2026-01-01T00:00:00Z",
                        "ends_at": "2026-02-01T00:00:00Z"
                    }
                }),
                external_subscription_id: Some(sub_id.clone()),
                external_customer_id: Some(customer.clone()),
                raw: json!({}),
            };
            engine.process(&event).await.expect("subscription event");

            let (user_id, status): (Option<i64>, String) = sqlx::query_as(
                r#"
                SELECT user_id, status FROM subscriptions
                WHERE provider = 'paddle' AND external_subscription_id = $1
                "#,
            )
            .bind(&sub_id)
            .fetch_one(&pool)
            .await
            .expect("subscription row");
            assert_eq!(user_id, Some(actor_id));
            assert_eq!(status, "active");
        }

        struct StubPaddle;

        #[async_trait]
        impl PaymentProvider for StubPaddle {
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
                    latest_invoice: None,
                })
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

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn scheduled_downgrade_applies_on_renewal_update() {
            let pool = test_pool().await;
            let mut registry = ProviderRegistry::new();
            registry.register(Arc::new(StubPaddle));
            let engine = test_engine(&pool, registry);

            let suffix = Uuid::new_v4().simple().to_string();
            let sub_external = format!("psub_{suffix}");
            let target_price = format!("pri_m_{suffix}");

            let (plan_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscription_plans
                    (name, paddle_price_id_monthly, paddle_price_id_yearly,
                     monthly_price_cents, annual_price_cents)
                VALUES ($1, $2, $3, 1000, 10000)
                RETURNING id
                "#,
            )
            .bind(format!("plan_{suffix}"))
            .bind(&target_price)
            .bind(format!("pri_y_{suffix}"))
            .fetch_one(&pool)
            .await
            .expect("plan");

            let (sub_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscriptions
                    (provider, external_subscription_id, status, plan_id, "interval")
                VALUES ('paddle', $1, 'active', $2, 'yearly')
                RETURNING id
                "#,
            )
            .bind(&sub_external)
            .bind(plan_id)
            .fetch_one(&pool)
            .await
            .expect("subscription");
            sqlx::query(
                "INSERT INTO scheduled_downgrades (subscription_id, target_price_id) VALUES ($1, $2)",
            )
            .bind(sub_id)
            .bind(&target_price)
            .execute(&pool)
            .await
            .expect("downgrade row");

            let event = NormalizedEvent {
                event_id: format!("evt_renew_{suffix}"),
                kind: EventKind::SubscriptionUpdated,
                provider: "paddle".to_string(),
                subject: json!({ "id": sub_external, "status": "active" }),
                external_subscription_id: Some(sub_external.clone()),
                external_customer_id: None,
                raw: json!({}),
            };
            engine.process(&event).await.expect("renewal event");

            let (pending,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM scheduled_downgrades WHERE subscription_id = $1",
            )
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .expect("count");
            assert_eq!(pending, 0);

            let (new_plan_id, interval): (Option<i64>, Option<String>) = sqlx::query_as(
                r#"SELECT plan_id, "interval" FROM subscriptions WHERE id = $1"#,
            )
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .expect("subscription row");
            assert_eq!(new_plan_id, Some(plan_id));
            assert_eq!(interval.as_deref(), Some("monthly"));
        }

        #[tokio::test]
        #[serial]
        #[ignore] // Requires database
        async fn downgrade_stays_pending_while_cancellation_is_flagged() {
            let pool = test_pool().await;
            let mut registry = ProviderRegistry::new();
            registry.register(Arc::new(StubPaddle));
            let engine = test_engine(&pool, registry);

            let suffix = Uuid::new_v4().simple().to_string();
            let sub_external = format!("psub_{suffix}");
            let target_price = format!("pri_m_{suffix}");

            let (plan_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscription_plans
                    (name, paddle_price_id_monthly, paddle_price_id_yearly,
                     monthly_price_cents, annual_price_cents)
                VALUES ($1, $2, $3, 1000, 10000)
                RETURNING id
                "#,
            )
            .bind(format!("plan_{suffix}"))
            .bind(&target_price)
            .bind(format!("pri_y_{suffix}"))
            .fetch_one(&pool)
            .await
            .expect("plan");

            let (sub_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscriptions
                    (provider, external_subscription_id, status, plan_id,
                     "interval", cancel_at_period_end)
                VALUES ('paddle', $1, 'active', $2, 'yearly', TRUE)
                RETURNING id
                "#,
            )
            .bind(&sub_external)
            .bind(plan_id)
            .fetch_one(&pool)
            .await
            .expect("subscription");
            sqlx::query(
                "INSERT INTO scheduled_downgrades (subscription_id, target_price_id) VALUES ($1, $2)",
            )
            .bind(sub_id)
            .bind(&target_price)
            .execute(&pool)
            .await
            .expect("downgrade row");

            let event = NormalizedEvent {
                event_id: format!("evt_renew_{suffix}"),
                kind: EventKind::SubscriptionUpdated,
                provider: "paddle".to_string(),
                subject: json!({ "id": sub_external, "status": "active" }),
                external_subscription_id: Some(sub_external.clone()),
                external_customer_id: None,
                raw: json!({}),
            };
            engine.process(&event).await.expect("renewal event");

            let (pending,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM scheduled_downgrades WHERE subscription_id = $1",
            )
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .expect("count");
            assert_eq!(pending, 1);

            let (kept_plan_id, interval): (Option<i64>, Option<String>) = sqlx::query_as(
                r#"SELECT plan_id, "interval" FROM subscriptions WHERE id = $1"#,
            )
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .expect("subscription row");
            assert_eq!(kept_plan_id, Some(plan_id));
            assert_eq!(interval.as_deref(), Some("yearly"));
        }
    }
}
