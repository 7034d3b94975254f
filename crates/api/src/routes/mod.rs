//! API routes

pub mod billing;
pub mod health;
pub mod webhooks;

use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use paysync_billing::ClientInfo;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Actor identity set by the fronting gateway after authentication
pub fn require_actor(headers: &HeaderMap) -> ApiResult<i64> {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing or invalid x-actor-id header".to_string()))
}

/// Extract client IP address from request headers.
/// Checks common proxy headers in order of preference.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
}

/// Client context recorded with audit rows
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        ip_address: extract_client_ip(headers),
        user_agent: headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
    }
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Webhooks are public; authenticity comes from signature verification
    let webhook_routes = Router::new().route("/webhooks/:provider", post(webhooks::receive));

    let billing_routes = Router::new()
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/plans", get(billing::list_plans))
        .route("/billing/payment-method", get(billing::get_payment_method))
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/usage", get(billing::get_usage))
        .route(
            "/billing/subscription/update",
            post(billing::update_subscription),
        )
        .route(
            "/billing/subscription/cancel",
            post(billing::cancel_subscription),
        );

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", billing_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn actor_header_parses() {
        let mut headers = HeaderMap::new();
        headers.insert("x-actor-id", HeaderValue::from_static("17"));
        assert_eq!(require_actor(&headers).unwrap(), 17);
    }

    #[test]
    fn missing_or_garbage_actor_header_is_rejected() {
        assert!(require_actor(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-actor-id", HeaderValue::from_static("not-a-number"));
        assert!(require_actor(&headers).is_err());
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
