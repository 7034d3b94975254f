//! Usage counters and usage overview
//!
//! Counters track consumption per organization and usage key against plan
//! limits. On plan changes the reconciliation engine resets a counter only
//! when the new limit is strictly greater than the old one; lateral moves
//! and downgrades keep accumulated usage.

use serde::Serialize;
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::plans::Plan;

/// Usage keys tracked against plan limits
pub const USAGE_KEY_SBOM: &str = "sbom_upload";
pub const USAGE_KEY_SCAN: &str = "project_scan";

/// Limits a plan grants per usage key
pub fn plan_limits(plan: &Plan) -> [(&'static str, i64); 2] {
    [
        (USAGE_KEY_SBOM, plan.sbom_limit),
        (USAGE_KEY_SCAN, plan.project_scan_limit),
    ]
}

/// Counter reset rule: reset only when the new limit is strictly greater
/// than the old one, or when the old limit is unknown.
pub fn should_reset(old_limit: Option<i64>, new_limit: i64) -> bool {
    match old_limit {
        None => true,
        Some(old) => new_limit > old,
    }
}

/// Per-key usage statistics
#[derive(Debug, Clone, Serialize)]
pub struct UsageKeyStats {
    pub key: String,
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percent_used: f64,
    pub next_reset: Option<OffsetDateTime>,
}

/// One day of usage history
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyUsage {
    pub day: Date,
    pub usage_key: String,
    pub count: i64,
}

/// Invoice aggregates shown alongside usage
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceStats {
    pub total_invoices: i64,
    pub total_paid_cents: i64,
}

/// Full usage overview for the API
#[derive(Debug, Clone, Serialize)]
pub struct UsageOverview {
    pub keys: Vec<UsageKeyStats>,
    pub history: Vec<DailyUsage>,
    pub invoices: InvoiceStats,
}

#[derive(Clone)]
pub struct UsageService {
    pool: PgPool,
}

impl UsageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reset counters whose limit expanded on a plan change. `old_limits`
    /// is None when the previous plan is unknown (always resets).
    pub async fn reset_expanded_counters(
        &self,
        organization_id: i64,
        old_limits: Option<&Plan>,
        new_plan: &Plan,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let old = old_limits.map(plan_limits);

        for (key, new_limit) in plan_limits(new_plan) {
            let old_limit = old.and_then(|limits| {
                limits
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, limit)| *limit)
            });

            if should_reset(old_limit, new_limit) {
                sqlx::query(
                    r#"
                    UPDATE usage_counters
                    SET used = 0, period_start = NOW(), period_end = $3
                    WHERE organization_id = $1 AND usage_key = $2
                    "#,
                )
                .bind(organization_id)
                .bind(key)
                .bind(period_end)
                .execute(&self.pool)
                .await?;

                tracing::info!(
                    organization_id = %organization_id,
                    usage_key = %key,
                    old_limit = ?old_limit,
                    new_limit = new_limit,
                    "Usage counter reset after limit expansion"
                );
            }
        }

        Ok(())
    }

    /// Per-key stats, 14-day daily history and invoice aggregates
    pub async fn overview(
        &self,
        organization_id: i64,
        actor_id: i64,
        plan: Option<&Plan>,
    ) -> BillingResult<UsageOverview> {
        let counters: Vec<(String, i64, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT usage_key, used, period_end
            FROM usage_counters
            WHERE organization_id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        let limits = plan.map(plan_limits).unwrap_or([
            (USAGE_KEY_SBOM, 10),
            (USAGE_KEY_SCAN, 10),
        ]);

        let keys = limits
            .iter()
            .map(|(key, limit)| {
                let (used, next_reset) = counters
                    .iter()
                    .find(|(k, _, _)| k == key)
                    .map(|(_, used, period_end)| (*used, *period_end))
                    .unwrap_or((0, None));

                let percent_used = if *limit > 0 {
                    (used as f64 / *limit as f64) * 100.0
                } else {
                    0.0
                };

                UsageKeyStats {
                    key: key.to_string(),
                    used,
                    limit: *limit,
                    remaining: (limit - used).max(0),
                    percent_used,
                    next_reset,
                }
            })
            .collect();

        let since = OffsetDateTime::now_utc().date() - Duration::days(14);
        let history = sqlx::query_as::<_, DailyUsage>(
            r#"
            SELECT day, usage_key, count
            FROM usage_daily
            WHERE organization_id = $1 AND day >= $2
            ORDER BY day ASC
            "#,
        )
        .bind(organization_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let invoice_row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(amount_paid_cents), 0)::BIGINT
            FROM invoices
            WHERE user_id = $1
            "#,
        )
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageOverview {
            keys,
            history,
            invoices: InvoiceStats {
                total_invoices: invoice_row.0,
                total_paid_cents: invoice_row.1.unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_requires_strictly_greater_limit() {
        assert!(should_reset(Some(10), 20));
        assert!(!should_reset(Some(10), 10));
        assert!(!should_reset(Some(10), 5));
    }

    #[test]
    fn unknown_old_limit_always_resets() {
        assert!(should_reset(None, 1));
        assert!(should_reset(None, 0));
    }
}
