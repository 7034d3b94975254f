//! Checkout session orchestration
//!
//! Resolves the plan and price, computes the tax breakdown, dispatches to
//! the provider and records the session in `checkout_records`. The recorded
//! raw session is what later lets webhook events recover the actor identity
//! from the provider customer id.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClientInfo, PaymentAudit};
use crate::plans::{BillingInterval, PlanStore};
use crate::provider::{BillingAddress, CheckoutContext, ProviderRegistry};
use crate::tax::{TaxBreakdown, TaxCalculator};

/// Request to open a checkout session
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub plan_id: i64,
    pub interval: BillingInterval,
    pub provider: String,
    pub billing_address: Option<BillingAddress>,
}

/// Response from creating a checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub session_id: String,
    pub checkout_url: Option<String>,
    pub tax: TaxBreakdown,
}

#[derive(Clone)]
pub struct CheckoutService {
    pool: PgPool,
    registry: ProviderRegistry,
    plans: PlanStore,
    tax: TaxCalculator,
    audit: PaymentAudit,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        pool: PgPool,
        registry: ProviderRegistry,
        plans: PlanStore,
        tax: TaxCalculator,
        audit: PaymentAudit,
        app_base_url: String,
    ) -> Self {
        Self {
            pool,
            registry,
            plans,
            tax,
            audit,
            app_base_url,
        }
    }

    pub async fn create_session(
        &self,
        actor_id: i64,
        request: CheckoutRequest,
        client: &ClientInfo,
    ) -> BillingResult<CheckoutOutcome> {
        let provider = self.registry.get(&request.provider)?;

        let plan = self.plans.by_id(request.plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanNotFound(plan.name));
        }

        let price_id = plan
            .price_id(provider.name(), request.interval)
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "plan '{}' has no {} price for provider '{}'",
                    plan.name,
                    request.interval,
                    provider.name()
                ))
            })?
            .to_string();

        if provider.name() == "paddle" {
            self.require_billing_address(actor_id, request.billing_address.as_ref())
                .await?;
        }

        let actor_email: Option<(String,)> =
            sqlx::query_as("SELECT email FROM users WHERE id = $1")
                .bind(actor_id)
                .fetch_optional(&self.pool)
                .await?;
        let actor_email = actor_email
            .map(|(email,)| email)
            .ok_or_else(|| BillingError::Validation(format!("unknown actor {actor_id}")))?;

        let jurisdiction = request
            .billing_address
            .as_ref()
            .map(|a| a.country_code.as_str());
        let tax = self.tax.breakdown(plan.amount_cents(request.interval), jurisdiction);

        let idempotency_key = Uuid::new_v4();

        let mut metadata = HashMap::new();
        metadata.insert("plan_id".to_string(), plan.id.to_string());
        metadata.insert("interval".to_string(), request.interval.to_string());

        let ctx = CheckoutContext {
            actor_id,
            actor_email: actor_email.clone(),
            price_id,
            plan_name: plan.name.clone(),
            tax: tax.clone(),
            currency: plan.currency.clone(),
            idempotency_key: idempotency_key.to_string(),
            success_url: format!("{}/billing/success", self.app_base_url),
            cancel_url: format!("{}/billing/cancel", self.app_base_url),
            billing_address: request.billing_address.clone(),
            metadata,
        };

        let result = provider.create_checkout(&ctx).await?;

        sqlx::query(
            r#"
            INSERT INTO checkout_records
                (actor_id, provider, session_id, customer_email, amount_cents,
                 currency, status, idempotency_key, raw_session)
            VALUES ($1, $2, $3, $4, $5, $6, 'created', $7, $8)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(actor_id)
        .bind(provider.name())
        .bind(&result.session_id)
        .bind(&actor_email)
        .bind(tax.total_cents)
        .bind(&plan.currency)
        .bind(idempotency_key)
        .bind(&result.raw_session)
        .execute(&self.pool)
        .await?;

        self.audit
            .record(
                Some(actor_id),
                "checkout.created",
                Some(&result.session_id),
                json!({
                    "plan_id": plan.id,
                    "interval": request.interval.as_str(),
                    "provider": provider.name(),
                    "total_cents": tax.total_cents,
                }),
                client,
            )
            .await;

        tracing::info!(
            actor_id = %actor_id,
            plan = %plan.name,
            provider = %provider.name(),
            session_id = %result.session_id,
            "Checkout session created"
        );

        Ok(CheckoutOutcome {
            session_id: result.session_id,
            checkout_url: result.checkout_url,
            tax,
        })
    }

    /// Paddle checkouts require a complete billing address. The error lists
    /// the missing fields together with the caller's saved addresses so the
    /// client can offer a picker.
    async fn require_billing_address(
        &self,
        actor_id: i64,
        address: Option<&BillingAddress>,
    ) -> BillingResult<()> {
        let missing = missing_address_fields(address);
        if missing.is_empty() {
            return Ok(());
        }

        let saved: Vec<(i64, Option<String>, String, String, bool)> = sqlx::query_as(
            r#"
            SELECT ba.id, ba.label, ba.country_code, ba.postal_code, ba.is_default
            FROM billing_addresses ba
            JOIN users u ON u.organization_id = ba.organization_id
            WHERE u.id = $1 AND ba.is_active = TRUE
            ORDER BY ba.is_default DESC, ba.created_at DESC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        let saved_addresses = saved
            .into_iter()
            .map(|(id, label, country_code, postal_code, is_default)| {
                json!({
                    "id": id,
                    "label": label,
                    "country_code": country_code,
                    "postal_code": postal_code,
                    "is_default": is_default,
                })
            })
            .collect::<Vec<_>>();

        Err(BillingError::BillingAddressRequired {
            missing,
            saved_addresses: json!(saved_addresses),
        })
    }
}

fn missing_address_fields(address: Option<&BillingAddress>) -> Vec<&'static str> {
    match address {
        None => vec!["country_code", "postal_code"],
        Some(addr) => {
            let mut missing = Vec::new();
            if addr.country_code.trim().is_empty() {
                missing.push("country_code");
            }
            if addr.postal_code.trim().is_empty() {
                missing.push("postal_code");
            }
            missing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_address_reports_both_fields() {
        assert_eq!(
            missing_address_fields(None),
            vec!["country_code", "postal_code"]
        );
    }

    #[test]
    fn blank_fields_are_reported_individually() {
        let addr = BillingAddress {
            country_code: "DE".to_string(),
            postal_code: "  ".to_string(),
        };
        assert_eq!(missing_address_fields(Some(&addr)), vec!["postal_code"]);
    }

    #[test]
    fn complete_address_passes() {
        let addr = BillingAddress {
            country_code: "DE".to_string(),
            postal_code: "10115".to_string(),
        };
        assert!(missing_address_fields(Some(&addr)).is_empty());
    }
}
