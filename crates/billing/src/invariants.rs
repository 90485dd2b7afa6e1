//! Billing Invariants Module
//!
//! Runnable consistency checks over subscriptions and payment orders. They can
//! be run after a batch of upgrades or from the worker to confirm the tables
//! are in a state the upgrade workflow can safely price against.
//!
//! Checks only read, never write.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be charged incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: Uuid,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingPlanRow {
    subscription_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct InvertedPeriodRow {
    subscription_id: Uuid,
    user_id: Uuid,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeOrderRow {
    order_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutTimestampRow {
    order_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct MultiplePendingRow {
    subscription_id: Uuid,
    user_id: Uuid,
    pending_count: i64,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary stamped with `checked_at`
    pub async fn run_all_checks(
        &self,
        checked_at: OffsetDateTime,
    ) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_active_subscription_plan_exists().await?);
        violations.extend(self.check_subscription_period_valid().await?);
        violations.extend(self.check_order_amount_non_negative().await?);
        violations.extend(self.check_paid_order_has_paid_at().await?);
        violations.extend(self.check_single_pending_order().await?);

        Ok(InvariantCheckSummary::from_violations(
            checked_at,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: At most 1 active subscription per user
    ///
    /// The upgrade workflow prices against the latest subscription; a second
    /// active one would keep granting access on the old plan.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as active_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected 1)",
                    row.active_count
                ),
                context: serde_json::json!({
                    "active_count": row.active_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Active subscriptions reference a plan that exists
    ///
    /// Pricing loads the current plan by id; a dangling reference makes every
    /// quote for that user fail with `NotFound`.
    async fn check_active_subscription_plan_exists(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingPlanRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.user_id, s.plan_id
            FROM subscriptions s
            LEFT JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.status = 'active' AND p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_subscription_plan_exists".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription {} references missing plan {}",
                    row.subscription_id, row.plan_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "plan_id": row.plan_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Subscriptions end after they start
    async fn check_subscription_period_valid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvertedPeriodRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, user_id, start_date, end_date
            FROM subscriptions
            WHERE end_date <= start_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_period_valid".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} ends at {} but starts at {}",
                    row.subscription_id, row.end_date, row.start_date
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "start_date": row.start_date.to_string(),
                    "end_date": row.end_date.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Payment orders never carry a negative amount
    ///
    /// Amounts come from the pricing engine, which clamps at zero. A negative
    /// amount means the order was written by something else.
    async fn check_order_amount_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeOrderRow> = sqlx::query_as(
            r#"
            SELECT id as order_id, user_id, amount
            FROM payment_orders
            WHERE amount < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "order_amount_non_negative".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment order {} has negative amount {}",
                    row.order_id, row.amount
                ),
                context: serde_json::json!({
                    "order_id": row.order_id,
                    "amount": row.amount.to_string(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Paid orders record when they were paid
    async fn check_paid_order_has_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as order_id, user_id
            FROM payment_orders
            WHERE status = 'paid' AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_order_has_paid_at".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Paid order {} has no paid_at timestamp", row.order_id),
                context: serde_json::json!({
                    "order_id": row.order_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: At most 1 unpaid upgrade order per subscription
    async fn check_single_pending_order(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiplePendingRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, user_id, COUNT(*) as pending_count
            FROM payment_orders
            WHERE status = 'created'
            GROUP BY subscription_id, user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_order".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} has {} unpaid upgrade orders (expected at most 1)",
                    row.subscription_id, row.pending_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "active_subscription_plan_exists" => {
                self.check_active_subscription_plan_exists().await
            }
            "subscription_period_valid" => self.check_subscription_period_valid().await,
            "order_amount_non_negative" => self.check_order_amount_non_negative().await,
            "paid_order_has_paid_at" => self.check_paid_order_has_paid_at().await,
            "single_pending_order" => self.check_single_pending_order().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "active_subscription_plan_exists",
            "subscription_period_valid",
            "order_amount_non_negative",
            "paid_order_has_paid_at",
            "single_pending_order",
        ]
    }
}


/// Run with `DATABASE_URL=... cargo test -p streamline-billing -- --ignored`
#[cfg(test)]
mod db_tests {
    use super::*;

    async fn setup_pool() -> PgPool {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/streamline_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        streamline_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_run_all_checks_uses_given_time() {
        let checker = InvariantChecker::new(setup_pool().await);
        let checked_at = time::macros::datetime!(2026-04-01 04:00 UTC);

        let summary = checker.run_all_checks(checked_at).await.unwrap();

        assert_eq!(summary.checked_at, checked_at);
        assert_eq!(summary.checks_run, InvariantChecker::available_checks().len());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_every_listed_check_runs() {
        let checker = InvariantChecker::new(setup_pool().await);

        for name in InvariantChecker::available_checks() {
            let violations = checker.run_check(name).await.unwrap();
            assert!(violations.iter().all(|v| v.invariant == name), "{}", name);
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_plan_reference_check_is_clean_when_plans_exist() {
        let pool = setup_pool().await;
        let plan_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO subscription_plans (name, plan_type, billing_cycle, price)
            VALUES ('basic monthly', 'basic', 'monthly', 199)
            ON CONFLICT (plan_type, billing_cycle) DO UPDATE SET price = EXCLUDED.price
            RETURNING id
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let user_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, plan_id, status, start_date, end_date)
            VALUES ($1, $2, 'active', NOW(), NOW() + INTERVAL '30 days')
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&pool)
        .await
        .unwrap();

        let checker = InvariantChecker::new(pool);
        let violations = checker
            .run_check("active_subscription_plan_exists")
            .await
            .unwrap();

        assert!(violations.iter().all(|v| !v.user_ids.contains(&user_id)));
    }
}
