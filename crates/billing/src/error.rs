//! Billing error types

/// Errors that can occur during billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Provider error ({provider}): {message}")]
    Provider {
        provider: &'static str,
        message: String,
        status: Option<u16>,
    },

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("No subscription found for actor {0}")]
    SubscriptionNotFound(i64),

    #[error("Card declined: {0}")]
    CardDeclined(String),

    #[error("Customer has no payment method on file")]
    PaymentMethodRequired,

    #[error("Billing address required")]
    BillingAddressRequired {
        missing: Vec<&'static str>,
        saved_addresses: serde_json::Value,
    },

    #[error("Invalid billing cycle change: {0}")]
    InvalidCycleSwitch(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Provider {
            provider: "http",
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;
