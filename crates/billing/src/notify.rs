//! Payment notification client
//!
//! Posts payment outcome events to the internal notification service.
//! Strictly best-effort: timeouts and failures are logged and swallowed.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::NotificationSettings;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct NotificationClient {
    http: reqwest::Client,
    settings: Option<NotificationSettings>,
}

/// Payload details for a payment notification
#[derive(Debug, Clone)]
pub struct PaymentNotice {
    pub organization_id: Option<i64>,
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub plan_name: Option<String>,
    pub invoice_url: Option<String>,
    pub status: String,
}

impl NotificationClient {
    pub fn new(settings: Option<NotificationSettings>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, settings }
    }

    /// Notify payment success or failure. No-op when the notification
    /// service is not configured.
    pub async fn notify_payment(&self, success: bool, notice: &PaymentNotice) {
        let Some(settings) = &self.settings else {
            return;
        };

        let (event_type, severity) = if success {
            ("payment.success", "info")
        } else {
            ("payment.failed", "critical")
        };

        let body: Value = json!({
            "type": event_type,
            "organization_id": notice.organization_id,
            "severity": severity,
            "payload": {
                "amount": notice.amount_cents,
                "currency": notice.currency,
                "plan_name": notice.plan_name,
                "invoice_url": notice.invoice_url,
                "status": notice.status,
            }
        });

        let result = self
            .http
            .post(&settings.url)
            .header("X-Service-Token", &settings.service_token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    status = %response.status(),
                    event_type = event_type,
                    "Notification service rejected payment event"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    event_type = event_type,
                    "Failed to deliver payment notification"
                );
            }
            Ok(_) => {}
        }
    }
}
