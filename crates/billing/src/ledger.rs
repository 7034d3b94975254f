//! Idempotency and audit ledger
//!
//! Every verified webhook event is recorded exactly once in `billing_events`
//! via a unique insert on the provider event id; the insert doubles as the
//! idempotency gate. `payment_audit` rows are best-effort and never fail the
//! surrounding operation.

use serde_json::Value;
use sqlx::PgPool;

use crate::error::BillingResult;

/// Outcome of attempting to record an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// First sighting, caller owns processing
    Recorded,
    /// Event id already in the ledger
    AlreadyProcessed,
}

#[derive(Clone)]
pub struct EventLedger {
    pool: PgPool,
}

impl EventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an event exactly once. Returns `AlreadyProcessed` when the
    /// event id has been seen before; duplicates are acknowledged without
    /// side effects.
    pub async fn record_event_once(
        &self,
        provider: &str,
        event_id: &str,
        payload: &Value,
    ) -> BillingResult<LedgerOutcome> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (event_id, provider, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(provider)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(_) => Ok(LedgerOutcome::Recorded),
            None => {
                tracing::info!(
                    event_id = %event_id,
                    provider = %provider,
                    "Duplicate webhook event, skipping"
                );
                Ok(LedgerOutcome::AlreadyProcessed)
            }
        }
    }
}

/// Client context captured from the originating request
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Best-effort payment audit trail
#[derive(Clone)]
pub struct PaymentAudit {
    pool: PgPool,
}

impl PaymentAudit {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write an audit row. Failures are logged and swallowed so auditing
    /// never breaks the payment path.
    pub async fn record(
        &self,
        actor_id: Option<i64>,
        action: &str,
        session_id: Option<&str>,
        details: Value,
        client: &ClientInfo,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_audit (actor_id, action, session_id, details, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(actor_id)
        .bind(action)
        .bind(session_id)
        .bind(&details)
        .bind(client.ip_address.as_deref())
        .bind(client.user_agent.as_deref())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                action = %action,
                error = %e,
                "Failed to write payment audit record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    #[ignore] // Requires database
    async fn duplicate_event_is_reported_as_already_processed() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = paysync_shared::create_pool(&url).await.expect("pool");
        let ledger = EventLedger::new(pool);

        let event_id = format!("evt_test_{}", uuid::Uuid::new_v4());
        let payload = json!({"id": event_id, "type": "invoice.paid"});

        let first = ledger
            .record_event_once("stripe", &event_id, &payload)
            .await
            .expect("first insert");
        let second = ledger
            .record_event_once("stripe", &event_id, &payload)
            .await
            .expect("second insert");

        assert_eq!(first, LedgerOutcome::Recorded);
        assert_eq!(second, LedgerOutcome::AlreadyProcessed);
    }
}
