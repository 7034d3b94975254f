//! Billing configuration
//!
//! All provider credentials and tunables are read from the environment once
//! at startup into an explicit config struct that is passed to the services
//! that need it. Nothing in this crate reads the environment after boot.

use std::collections::HashMap;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Stripe-compatible provider settings
#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
}

/// Paddle-compatible provider settings
#[derive(Debug, Clone)]
pub struct PaddleSettings {
    pub api_key: String,
    pub webhook_secret: String,
    pub base_url: String,
}

/// Notification service settings (absent disables notifications)
#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub url: String,
    pub service_token: String,
}

/// Tax calculation settings
#[derive(Debug, Clone)]
pub struct TaxSettings {
    pub default_rate: f64,
    pub default_code: String,
    pub default_jurisdiction: String,
    /// Jurisdiction code (e.g. "IT", "DE") to fractional rate
    pub rate_map: HashMap<String, f64>,
}

impl Default for TaxSettings {
    fn default() -> Self {
        Self {
            default_rate: 0.02,
            default_code: "IT_DIGITAL".to_string(),
            default_jurisdiction: "Digital/IT Services".to_string(),
            rate_map: HashMap::new(),
        }
    }
}

/// Top-level billing configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeSettings,
    pub paddle: PaddleSettings,
    pub notification: Option<NotificationSettings>,
    pub tax: TaxSettings,
    /// Fallback billing contact for subscription skeletons created before
    /// any identity can be resolved (e.g. invoice webhook racing checkout).
    pub fallback_billing_contact_id: i64,
    pub free_plan_id: Option<i64>,
    /// Base URL used for checkout success/cancel redirects
    pub app_base_url: String,
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let stripe = StripeSettings {
            secret_key: require("STRIPE_SECRET_KEY")?,
            webhook_secret: require("STRIPE_WEBHOOK_SECRET")?,
        };

        let paddle_env = std::env::var("PADDLE_ENV").unwrap_or_else(|_| "sandbox".to_string());
        let paddle_base_url = if paddle_env == "production" {
            "https://api.paddle.com".to_string()
        } else {
            "https://sandbox-api.paddle.com".to_string()
        };

        let paddle = PaddleSettings {
            api_key: require("PADDLE_API_KEY")?,
            webhook_secret: require("PADDLE_WEBHOOK_SECRET")?,
            base_url: paddle_base_url,
        };

        let notification = match std::env::var("NOTIFICATION_SERVICE_URL") {
            Ok(url) if !url.is_empty() => Some(NotificationSettings {
                url,
                service_token: std::env::var("NOTIFICATION_SERVICE_TOKEN").unwrap_or_default(),
            }),
            _ => None,
        };

        let mut tax = TaxSettings::default();
        if let Ok(rate) = std::env::var("TAX_DEFAULT_RATE") {
            tax.default_rate = rate
                .parse()
                .map_err(|e| ConfigError::Invalid("TAX_DEFAULT_RATE", format!("{e}")))?;
        }
        if let Ok(code) = std::env::var("TAX_DEFAULT_CODE") {
            tax.default_code = code;
        }
        if let Ok(jurisdiction) = std::env::var("TAX_DEFAULT_JURISDICTION") {
            tax.default_jurisdiction = jurisdiction;
        }
        if let Ok(map) = std::env::var("TAX_RATE_MAP") {
            tax.rate_map = serde_json::from_str(&map)
                .map_err(|e| ConfigError::Invalid("TAX_RATE_MAP", e.to_string()))?;
        }

        let fallback_billing_contact_id = match std::env::var("BILLING_CONTACT_USER_ID") {
            Ok(v) => v
                .parse()
                .map_err(|e| ConfigError::Invalid("BILLING_CONTACT_USER_ID", format!("{e}")))?,
            Err(_) => 42,
        };

        let free_plan_id = match std::env::var("FREE_PLAN_ID") {
            Ok(v) => Some(
                v.parse()
                    .map_err(|e| ConfigError::Invalid("FREE_PLAN_ID", format!("{e}")))?,
            ),
            Err(_) => None,
        };

        let app_base_url = std::env::var("APP_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            stripe,
            paddle,
            notification,
            tax,
            fallback_billing_contact_id,
            free_plan_id,
            app_base_url,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}
