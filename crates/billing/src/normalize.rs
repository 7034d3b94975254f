//! Webhook event normalization
//!
//! Incoming provider payloads differ in envelope shape, event naming and
//! money representation. Everything downstream of the webhook endpoint works
//! on the canonical [`NormalizedEvent`] produced here; the reconciliation
//! engine dispatches on the closed [`EventKind`] enum rather than matching
//! raw provider strings.

use serde_json::Value;

/// Canonical event kinds across providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    InvoicePaid,
    TransactionCompleted,
    PaymentFailed,
    Unknown(String),
}

impl EventKind {
    /// Map a provider event type string onto the canonical kind
    pub fn from_provider(provider: &str, event_type: &str) -> Self {
        match (provider, event_type) {
            ("stripe", "checkout.session.completed") => Self::CheckoutCompleted,
            ("stripe", "customer.subscription.created") => Self::SubscriptionCreated,
            ("stripe", "customer.subscription.updated") => Self::SubscriptionUpdated,
            ("stripe", "customer.subscription.deleted") => Self::SubscriptionCanceled,
            ("stripe", "invoice.paid") | ("stripe", "invoice.payment_succeeded") => {
                Self::InvoicePaid
            }
            ("stripe", "invoice.payment_failed") => Self::PaymentFailed,
            ("paddle", "subscription.created") => Self::SubscriptionCreated,
            ("paddle", "subscription.updated") => Self::SubscriptionUpdated,
            ("paddle", "subscription.canceled") => Self::SubscriptionCanceled,
            ("paddle", "transaction.completed") => Self::TransactionCompleted,
            ("paddle", "transaction.payment_failed") => Self::PaymentFailed,
            (_, other) => Self::Unknown(other.to_string()),
        }
    }
}

/// Normalization failure (maps to HTTP 400 at the webhook endpoint)
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Event payload is missing an event id")]
    MissingEventId,
    #[error("Event payload is missing an event type")]
    MissingEventType,
    #[error("Malformed event payload: {0}")]
    Malformed(&'static str),
}

/// A provider webhook event in canonical form
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub provider: String,
    /// The primary object the event describes (subscription, invoice,
    /// transaction or checkout session payload)
    pub subject: Value,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub raw: Value,
}

/// Normalize a raw webhook payload.
///
/// Missing event id or event type is a hard error; unknown event types are
/// not, they normalize to [`EventKind::Unknown`] and get acknowledged
/// without side effects.
pub fn normalize(provider: &str, payload: &Value) -> Result<NormalizedEvent, NormalizeError> {
    if !payload.is_object() {
        return Err(NormalizeError::Malformed("payload is not a JSON object"));
    }

    let (id_field, type_field) = match provider {
        "paddle" => ("event_id", "event_type"),
        _ => ("id", "type"),
    };

    let event_id = payload
        .get(id_field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingEventId)?
        .to_string();

    let event_type = payload
        .get(type_field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingEventType)?;

    let subject = match provider {
        "paddle" => payload.get("data").cloned().unwrap_or(Value::Null),
        _ => payload
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .unwrap_or(Value::Null),
    };

    let kind = EventKind::from_provider(provider, event_type);
    let external_subscription_id = extract_subscription_id(provider, &kind, &subject);
    let external_customer_id = extract_customer_id(provider, &subject);

    Ok(NormalizedEvent {
        event_id,
        kind,
        provider: provider.to_string(),
        subject,
        external_subscription_id,
        external_customer_id,
        raw: payload.clone(),
    })
}

fn extract_subscription_id(provider: &str, kind: &EventKind, subject: &Value) -> Option<String> {
    let field = match (provider, kind) {
        (
            _,
            EventKind::SubscriptionCreated
            | EventKind::SubscriptionUpdated
            | EventKind::SubscriptionCanceled,
        ) => "id",
        ("paddle", _) => "subscription_id",
        _ => "subscription",
    };
    subject
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_customer_id(provider: &str, subject: &Value) -> Option<String> {
    let field = match provider {
        "paddle" => "customer_id",
        _ => "customer",
    };
    subject
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Normalize a provider money value into integer cents.
///
/// Integers pass through, floats are treated as major units (x100, rounded
/// half away from zero), numeric strings parse per the same rules, and
/// anything unparseable collapses to 0.
pub fn to_cents(value: &Value) -> i64 {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                (f * 100.0).round() as i64
            } else {
                0
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if s.contains('.') {
                s.parse::<f64>()
                    .map(|f| (f * 100.0).round() as i64)
                    .unwrap_or(0)
            } else {
                s.parse::<i64>().unwrap_or(0)
            }
        }
        _ => 0,
    }
}
