//! Billing endpoints
//!
//! All routes act on behalf of the actor identified by the `x-actor-id`
//! header, which the fronting gateway sets after authentication.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use paysync_billing::{
    BillingAddress, BillingInterval, CancelMode, ChangeAction, ChangeOutcome, ChangeRequest,
    CheckoutOutcome, CheckoutRequest, RefundMode,
};

use crate::error::{ApiError, ApiResult};
use crate::routes::{client_info, require_actor};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub plan_id: i64,
    pub interval: Option<String>,
    pub provider: Option<String>,
    pub billing_address: Option<AddressBody>,
}

#[derive(Debug, Deserialize)]
pub struct AddressBody {
    pub country_code: String,
    pub postal_code: String,
}

/// POST /api/v1/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> ApiResult<Json<CheckoutOutcome>> {
    let actor_id = require_actor(&headers)?;
    let client = client_info(&headers);

    let interval = match body.interval.as_deref() {
        Some(raw) => BillingInterval::from_str(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown billing interval: {raw}")))?,
        None => BillingInterval::default(),
    };

    let request = CheckoutRequest {
        plan_id: body.plan_id,
        interval,
        provider: body.provider.unwrap_or_else(|| "stripe".to_string()),
        billing_address: body.billing_address.map(|a| BillingAddress {
            country_code: a.country_code,
            postal_code: a.postal_code,
        }),
    };

    let outcome = state
        .billing
        .checkout
        .create_session(actor_id, request, &client)
        .await?;
    Ok(Json(outcome))
}

/// GET /api/v1/billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor_id = require_actor(&headers)?;

    let Some(sub) = state.billing.subscriptions.latest_for_actor(actor_id).await? else {
        return Ok(Json(json!({ "subscription": null })));
    };

    let plan = match sub.plan_id {
        Some(plan_id) => state.billing.plans.by_id(plan_id).await.ok(),
        None => None,
    };

    let pending_downgrade: Option<(String, OffsetDateTime)> = sqlx::query_as(
        "SELECT target_price_id, created_at FROM scheduled_downgrades WHERE subscription_id = $1",
    )
    .bind(sub.id)
    .fetch_optional(&state.pool)
    .await?;

    Ok(Json(json!({
        "subscription": sub,
        "plan": plan,
        "scheduled_downgrade": pending_downgrade.map(|(target_price_id, created_at)| json!({
            "target_price_id": target_price_id,
            "scheduled_at": created_at,
        })),
    })))
}

/// GET /api/v1/billing/plans
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let plans = state.billing.plans.active_plans().await?;
    Ok(Json(json!({ "plans": plans })))
}

/// GET /api/v1/billing/payment-method
pub async fn get_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor_id = require_actor(&headers)?;

    let method: Option<(String, Option<String>, Option<String>, Option<i32>, Option<i32>)> =
        sqlx::query_as(
            r#"
            SELECT provider, brand, last4, exp_month, exp_year
            FROM payment_methods
            WHERE actor_id = $1
            ORDER BY is_default DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(actor_id)
        .fetch_optional(&state.pool)
        .await?;

    Ok(Json(json!({
        "payment_method": method.map(|(provider, brand, last4, exp_month, exp_year)| json!({
            "provider": provider,
            "brand": brand,
            "last4": last4,
            "exp_month": exp_month,
            "exp_year": exp_year,
        })),
    })))
}

#[derive(Debug, Deserialize)]
pub struct InvoiceQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct InvoiceRow {
    pub id: i64,
    pub external_invoice_id: String,
    pub amount_due_cents: Option<i64>,
    pub amount_paid_cents: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub subtotal_cents: Option<i64>,
    pub tax_cents: Option<i64>,
    pub total_cents: Option<i64>,
    pub created_at: OffsetDateTime,
}

/// GET /api/v1/billing/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<InvoiceQuery>,
) -> ApiResult<Json<Value>> {
    let actor_id = require_actor(&headers)?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(6).clamp(1, 100);
    let offset = (page - 1) * limit;

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE user_id = $1")
        .bind(actor_id)
        .fetch_one(&state.pool)
        .await?;

    let invoices: Vec<InvoiceRow> = sqlx::query_as(
        r#"
        SELECT id, external_invoice_id, amount_due_cents, amount_paid_cents,
               currency, status, hosted_invoice_url, invoice_pdf_url,
               period_start, period_end, subtotal_cents, tax_cents,
               total_cents, created_at
        FROM invoices
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(actor_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({
        "invoices": invoices,
        "page": page,
        "limit": limit,
        "total": total,
        "total_pages": total_pages(total, limit),
    })))
}

/// Ceiling division for pagination
pub fn total_pages(total: i64, limit: i64) -> i64 {
    if limit <= 0 {
        return 0;
    }
    (total + limit - 1) / limit
}

/// GET /api/v1/billing/usage
pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor_id = require_actor(&headers)?;

    let organization_id = state
        .billing
        .subscriptions
        .organization_of_user(actor_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("Actor has no organization".to_string()))?;

    let sub = state.billing.subscriptions.latest_for_actor(actor_id).await?;
    let plan = match sub.as_ref().and_then(|s| s.plan_id) {
        Some(plan_id) => state.billing.plans.by_id(plan_id).await.ok(),
        None => None,
    };

    let overview = state
        .billing
        .usage
        .overview(organization_id, actor_id, plan.as_ref())
        .await?;

    Ok(Json(json!({
        "usage": overview,
        "plan": plan,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangeBody {
    pub action: ChangeAction,
    pub plan_id: Option<i64>,
    pub interval: Option<String>,
}

/// POST /api/v1/billing/subscription/update
pub async fn update_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChangeBody>,
) -> ApiResult<Json<ChangeOutcome>> {
    let actor_id = require_actor(&headers)?;
    let client = client_info(&headers);

    let interval = match body.interval.as_deref() {
        Some(raw) => Some(
            BillingInterval::from_str(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown billing interval: {raw}")))?,
        ),
        None => None,
    };

    let outcome = state
        .billing
        .lifecycle
        .change(
            actor_id,
            ChangeRequest {
                action: body.action,
                plan_id: body.plan_id,
                interval,
            },
            &client,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub mode: CancelMode,
    pub refund: Option<RefundMode>,
}

/// POST /api/v1/billing/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<Value>> {
    let actor_id = require_actor(&headers)?;
    let client = client_info(&headers);

    let result = state
        .billing
        .lifecycle
        .cancel(
            actor_id,
            body.mode,
            body.refund.unwrap_or(RefundMode::None),
            &client,
        )
        .await?;

    Ok(Json(json!({ "cancellation": result })))
}

#[cfg(test)]
mod tests {
    use super::total_pages;

    #[test]
    fn pagination_rounds_up() {
        assert_eq!(total_pages(0, 6), 0);
        assert_eq!(total_pages(1, 6), 1);
        assert_eq!(total_pages(6, 6), 1);
        assert_eq!(total_pages(7, 6), 2);
        assert_eq!(total_pages(13, 6), 3);
    }
}
