//! PaySync shared utilities
//!
//! Database pool construction and migration plumbing shared by the API
//! binary and the billing crate's integration tests.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;

pub use db::*;
