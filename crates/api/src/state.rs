//! Shared application state

use sqlx::PgPool;

use paysync_billing::Billing;

use crate::config::Config;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Billing,
    pub config: Config,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Billing::new(pool.clone(), config.billing.clone());
        Self {
            pool,
            billing,
            config,
        }
    }
}
