//! Subscription plan catalog
//!
//! Plans carry one external price id per provider and billing interval.
//! Interval resolution (which interval a given external price id belongs to)
//! drives plan assignment during reconciliation and cycle-switch validation.

use serde::Serialize;
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// Billing interval for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "year" | "annual" | "annually" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl Default for BillingInterval {
    fn default() -> Self {
        Self::Monthly
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row from subscription_plans
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub stripe_price_id_monthly: Option<String>,
    pub stripe_price_id_yearly: Option<String>,
    pub stripe_product_id: Option<String>,
    pub paddle_price_id_monthly: Option<String>,
    pub paddle_price_id_yearly: Option<String>,
    pub paddle_product_id: Option<String>,
    pub sbom_limit: i64,
    pub project_scan_limit: i64,
    pub scan_rate_limit: i64,
    pub user_limit: i64,
    pub monthly_price_cents: i64,
    pub annual_price_cents: i64,
    pub currency: String,
    pub is_active: bool,
}

impl Plan {
    /// External price id for a provider/interval pair
    pub fn price_id(&self, provider: &str, interval: BillingInterval) -> Option<&str> {
        match (provider, interval) {
            ("stripe", BillingInterval::Monthly) => self.stripe_price_id_monthly.as_deref(),
            ("stripe", BillingInterval::Yearly) => self.stripe_price_id_yearly.as_deref(),
            ("paddle", BillingInterval::Monthly) => self.paddle_price_id_monthly.as_deref(),
            ("paddle", BillingInterval::Yearly) => self.paddle_price_id_yearly.as_deref(),
            _ => None,
        }
    }

    /// Which interval a price id corresponds to, if it belongs to this plan
    pub fn interval_for_price(&self, price_id: &str) -> Option<BillingInterval> {
        let monthly = [
            self.stripe_price_id_monthly.as_deref(),
            self.paddle_price_id_monthly.as_deref(),
        ];
        let yearly = [
            self.stripe_price_id_yearly.as_deref(),
            self.paddle_price_id_yearly.as_deref(),
        ];
        if monthly.iter().any(|p| *p == Some(price_id)) {
            return Some(BillingInterval::Monthly);
        }
        if yearly.iter().any(|p| *p == Some(price_id)) {
            return Some(BillingInterval::Yearly);
        }
        None
    }

    /// Price in cents for an interval
    pub fn amount_cents(&self, interval: BillingInterval) -> i64 {
        match interval {
            BillingInterval::Monthly => self.monthly_price_cents,
            BillingInterval::Yearly => self.annual_price_cents,
        }
    }
}

const PLAN_COLUMNS: &str = r#"
    id, name, description,
    stripe_price_id_monthly, stripe_price_id_yearly, stripe_product_id,
    paddle_price_id_monthly, paddle_price_id_yearly, paddle_product_id,
    sbom_limit, project_scan_limit, scan_rate_limit, user_limit,
    monthly_price_cents, annual_price_cents, currency, is_active
"#;

/// Read access to the plan catalog
#[derive(Clone)]
pub struct PlanStore {
    pool: PgPool,
}

impl PlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE is_active = TRUE ORDER BY monthly_price_cents ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn by_id(&self, plan_id: i64) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = $1"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// Find the plan owning an external price id (any provider, any interval)
    pub async fn by_price_id(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            SELECT {PLAN_COLUMNS} FROM subscription_plans
            WHERE stripe_price_id_monthly = $1
               OR stripe_price_id_yearly = $1
               OR paddle_price_id_monthly = $1
               OR paddle_price_id_yearly = $1
            "#
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan {
            id: 1,
            name: "pro".to_string(),
            description: None,
            stripe_price_id_monthly: Some("price_m".to_string()),
            stripe_price_id_yearly: Some("price_y".to_string()),
            stripe_product_id: None,
            paddle_price_id_monthly: Some("pri_m".to_string()),
            paddle_price_id_yearly: Some("pri_y".to_string()),
            paddle_product_id: None,
            sbom_limit: 100,
            project_scan_limit: 50,
            scan_rate_limit: 60,
            user_limit: 5,
            monthly_price_cents: 2900,
            annual_price_cents: 29000,
            currency: "usd".to_string(),
            is_active: true,
        }
    }

    #[test]
    fn interval_parsing_accepts_aliases() {
        assert_eq!(BillingInterval::from_str("month"), Some(BillingInterval::Monthly));
        assert_eq!(BillingInterval::from_str("ANNUAL"), Some(BillingInterval::Yearly));
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }

    #[test]
    fn price_id_resolution_per_provider() {
        let p = plan();
        assert_eq!(p.price_id("stripe", BillingInterval::Yearly), Some("price_y"));
        assert_eq!(p.price_id("paddle", BillingInterval::Monthly), Some("pri_m"));
        assert_eq!(p.price_id("square", BillingInterval::Monthly), None);
    }

    #[test]
    fn interval_for_price_rejects_foreign_ids() {
        let p = plan();
        assert_eq!(p.interval_for_price("pri_y"), Some(BillingInterval::Yearly));
        assert_eq!(p.interval_for_price("price_other"), None);
    }
}
