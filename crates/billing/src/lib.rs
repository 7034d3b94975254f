//! PaySync billing engine
//!
//! Reconciles local subscription state with external payment providers.
//! Providers push webhook events; the [`normalize`] module turns them into
//! canonical events, the [`ledger`] guarantees exactly-once processing and
//! the [`reconcile`] engine drives the database toward provider truth.
//! Outbound flows (checkout, plan changes, cancellation) live in
//! [`checkout`] and [`lifecycle`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod checkout;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod normalize;
pub mod notify;
pub mod plans;
pub mod provider;
pub mod providers;
pub mod reconcile;
pub mod subscriptions;
pub mod tax;
pub mod usage;

pub use checkout::{CheckoutOutcome, CheckoutRequest, CheckoutService};
pub use config::{BillingConfig, ConfigError};
pub use error::{BillingError, BillingResult};
pub use ledger::{ClientInfo, EventLedger, LedgerOutcome, PaymentAudit};
pub use lifecycle::{
    CancelMode, CancellationResult, ChangeAction, ChangeOutcome, ChangeRequest, LifecycleService,
    RefundMode,
};
pub use normalize::{normalize, EventKind, NormalizeError, NormalizedEvent};
pub use plans::{BillingInterval, Plan, PlanStore};
pub use provider::{BillingAddress, PaymentProvider, ProviderRegistry};
pub use providers::{PaddleProvider, StripeProvider};
pub use reconcile::ReconciliationEngine;
pub use subscriptions::{Subscription, SubscriptionStore};
pub use tax::{TaxBreakdown, TaxCalculator};
pub use usage::{UsageOverview, UsageService};

use std::sync::Arc;

use sqlx::PgPool;

use crate::notify::NotificationClient;

/// Everything the API layer needs, wired from a pool and a config.
///
/// Construction registers both providers; individual services share the
/// pool and the registry.
#[derive(Clone)]
pub struct Billing {
    pub registry: ProviderRegistry,
    pub ledger: EventLedger,
    pub audit: PaymentAudit,
    pub plans: PlanStore,
    pub subscriptions: SubscriptionStore,
    pub usage: UsageService,
    pub tax: TaxCalculator,
    pub checkout: CheckoutService,
    pub lifecycle: LifecycleService,
    pub engine: Arc<ReconciliationEngine>,
}

impl Billing {
    pub fn new(pool: PgPool, config: BillingConfig) -> Self {
        let mut registry = ProviderRegistry::default();
        registry.register(Arc::new(StripeProvider::new(&config.stripe)));
        registry.register(Arc::new(PaddleProvider::new(&config.paddle)));

        let ledger = EventLedger::new(pool.clone());
        let audit = PaymentAudit::new(pool.clone());
        let plans = PlanStore::new(pool.clone());
        let subscriptions = SubscriptionStore::new(pool.clone());
        let usage = UsageService::new(pool.clone());
        let tax = TaxCalculator::new(config.tax.clone());
        let notifier = NotificationClient::new(config.notification.clone());

        let checkout = CheckoutService::new(
            pool.clone(),
            registry.clone(),
            plans.clone(),
            tax.clone(),
            audit.clone(),
            config.app_base_url.clone(),
        );

        let lifecycle = LifecycleService::new(
            pool.clone(),
            registry.clone(),
            plans.clone(),
            subscriptions.clone(),
            audit.clone(),
        );

        let engine = Arc::new(ReconciliationEngine::new(
            pool,
            registry.clone(),
            plans.clone(),
            subscriptions.clone(),
            usage.clone(),
            notifier,
            audit.clone(),
            config.fallback_billing_contact_id,
        ));

        Self {
            registry,
            ledger,
            audit,
            plans,
            subscriptions,
            usage,
            tax,
            checkout,
            lifecycle,
            engine,
        }
    }
}
