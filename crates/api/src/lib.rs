//! PaySync API Library
//!
//! HTTP surface for the billing engine: provider webhooks and the
//! billing management endpoints.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
