//! Subscription row type and read access
//!
//! Writes happen in the reconciliation engine and lifecycle service; this
//! module owns the row mapping and the read queries shared across them and
//! the API layer.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// A row from the subscriptions table
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: Option<i64>,
    pub billing_contact_user_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub provider: String,
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub quantity: i32,
    pub interval: Option<String>,
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, billing_contact_user_id, plan_id, provider,
    external_subscription_id, external_customer_id, status,
    current_period_start, current_period_end, cancel_at_period_end,
    trial_end, quantity, "interval"
"#;

#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The actor's most recent subscription that is not deactivated
    pub async fn latest_for_actor(&self, actor_id: i64) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1 AND status != 'inactive'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Same as [`latest_for_actor`](Self::latest_for_actor) but an error
    /// when the actor has no subscription
    pub async fn require_for_actor(&self, actor_id: i64) -> BillingResult<Subscription> {
        self.latest_for_actor(actor_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(actor_id))
    }

    pub async fn by_external(
        &self,
        provider: &str,
        external_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE provider = $1 AND external_subscription_id = $2
            "#
        ))
        .bind(provider)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Organization the user belongs to, if any
    pub async fn organization_of_user(&self, user_id: i64) -> BillingResult<Option<i64>> {
        let org: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT organization_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(org.and_then(|(id,)| id))
    }
}
