// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Streamline Billing Module
//!
//! Prices subscription upgrades and records the resulting payment orders.
//!
//! ## Features
//!
//! - **Upgrade Pricing**: Pure calculator for basic -> advance upgrades with a
//!   grace window and yearly proration
//! - **Upgrade Orders**: Quote, order, complete, and cancel upgrades against
//!   Postgres with optimistic locking
//! - **Expiry**: Lapse subscriptions whose paid period has ended
//! - **Invariants**: Read-only consistency checks over billing tables

pub mod error;
pub mod invariants;
pub mod models;
pub mod subscriptions;
pub mod upgrade;


// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{ActiveSubscription, PaymentOrder, SubscriptionPlan};

// Subscriptions
pub use subscriptions::{price_upgrade, CompletedUpgrade, SubscriptionService, UpgradeQuote};

// Upgrade pricing
pub use upgrade::{
    days_since_start, PricingDecision, UpgradeInputError, UpgradePricingEngine,
    GRACE_PERIOD_DAYS, INVALID_UPGRADE_PATH, PRORATION_MONTH_DAYS,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            subscriptions: SubscriptionService::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
