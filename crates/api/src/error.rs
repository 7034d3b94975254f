//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paysync_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("Payment required: {0}")]
    PaymentRequired(String),
    #[error("Billing address required")]
    BillingAddressRequired {
        missing: Vec<&'static str>,
        saved_addresses: serde_json::Value,
    },
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // The billing-address error carries structured fields so the client
        // can offer a saved-address picker; everything else is code+message.
        if let ApiError::BillingAddressRequired {
            missing,
            saved_addresses,
        } = self
        {
            let body = Json(json!({
                "error": {
                    "code": "BILLING_ADDRESS_REQUIRED",
                    "message": "Billing address required",
                    "required_fields": missing,
                    "saved_addresses": saved_addresses,
                }
            }));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }

        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::PaymentRequired(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", msg.clone())
            }
            ApiError::BillingAddressRequired { .. } => (
                StatusCode::BAD_REQUEST,
                "BILLING_ADDRESS_REQUIRED",
                self.to_string(),
            ),
            ApiError::WebhookSignatureInvalid => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                self.to_string(),
            ),

            // Internal
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::CardDeclined(msg) => ApiError::PaymentRequired(msg),
            BillingError::PaymentMethodRequired => {
                ApiError::PaymentRequired("Customer has no payment method on file".to_string())
            }
            BillingError::BillingAddressRequired {
                missing,
                saved_addresses,
            } => ApiError::BillingAddressRequired {
                missing,
                saved_addresses,
            },
            BillingError::WebhookSignatureInvalid => ApiError::WebhookSignatureInvalid,
            BillingError::MalformedPayload(msg) => ApiError::BadRequest(msg),
            BillingError::UnknownProvider(name) => {
                ApiError::BadRequest(format!("Unknown payment provider: {name}"))
            }
            BillingError::PlanNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound
            }
            BillingError::InvalidCycleSwitch(msg) | BillingError::Validation(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::Database(db) => ApiError::from(db),
            BillingError::StripeApi(msg) => {
                tracing::error!("Stripe API error: {}", msg);
                ApiError::ServiceUnavailable
            }
            BillingError::Provider {
                provider, message, ..
            } => {
                tracing::error!(provider = provider, "Provider error: {}", message);
                ApiError::ServiceUnavailable
            }
            BillingError::RefundFailed(msg) => {
                tracing::error!("Refund failed: {}", msg);
                ApiError::Internal
            }
            BillingError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                ApiError::Internal
            }
            BillingError::Internal(msg) => {
                tracing::error!("Billing internal error: {}", msg);
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
