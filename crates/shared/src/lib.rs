#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Streamline Shared
//!
//! Types and database helpers used by the API, billing, and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{BillingCycle, OrderStatus, ParseEnumError, PlanType, SubscriptionStatus};
