//! Subscription management
//!
//! Loads plans and subscriptions, prices upgrades through
//! [`UpgradePricingEngine`], and turns accepted quotes into payment orders.
//! Collecting the money is left to the payment collaborator, which reports
//! back through [`SubscriptionService::complete_upgrade_order`].

use serde::Serialize;
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use streamline_shared::{OrderStatus, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    ActiveSubscription, PaymentOrder, PaymentOrderRow, PlanRow, SubscriptionPlan, SubscriptionRow,
};
use crate::upgrade::{PricingDecision, UpgradePricingEngine};

/// A priced upgrade request, with the records it was priced from
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeQuote {
    pub subscription: ActiveSubscription,
    pub current_plan: SubscriptionPlan,
    pub target_plan: SubscriptionPlan,
    pub decision: PricingDecision,
}

/// Result of applying a paid upgrade order
#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpgrade {
    pub order: PaymentOrder,
    pub subscription: ActiveSubscription,
}

/// Price an upgrade for a subscription that must currently be active
pub fn price_upgrade(
    subscription: &ActiveSubscription,
    current_plan: &SubscriptionPlan,
    target_plan: &SubscriptionPlan,
    now: OffsetDateTime,
) -> BillingResult<PricingDecision> {
    if subscription.status != SubscriptionStatus::Active {
        return Err(BillingError::InvalidSubscriptionState(format!(
            "subscription {} is {}",
            subscription.id, subscription.status
        )));
    }

    Ok(UpgradePricingEngine::quote(
        subscription,
        current_plan,
        target_plan,
        now,
    )?)
}

/// Subscription service backed by Postgres
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All catalog plans, basic before advance, monthly before yearly
    pub async fn list_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, plan_type, billing_cycle, price
            FROM subscription_plans
            ORDER BY
                CASE plan_type WHEN 'basic' THEN 0 ELSE 1 END,
                CASE billing_cycle WHEN 'monthly' THEN 0 ELSE 1 END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionPlan::try_from).collect()
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        fetch_plan(&self.pool, plan_id).await
    }

    /// The user's current subscription, if it is active.
    ///
    /// Uses the same "newest subscription" rule as quoting and ordering, so a
    /// user whose newest subscription is cancelled has no active one here.
    pub async fn get_active_subscription(&self, user_id: Uuid) -> BillingResult<ActiveSubscription> {
        let subscription = fetch_latest_subscription(&self.pool, user_id).await?;

        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::NotFound(format!(
                "No active subscription for user {}",
                user_id
            )));
        }

        Ok(subscription)
    }

    /// Price an upgrade without recording anything
    pub async fn quote_upgrade(
        &self,
        user_id: Uuid,
        target_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UpgradeQuote> {
        let subscription = fetch_latest_subscription(&self.pool, user_id).await?;
        let current_plan = fetch_plan(&self.pool, subscription.plan_id).await?;
        let target_plan = fetch_plan(&self.pool, target_plan_id).await?;

        let decision = price_upgrade(&subscription, &current_plan, &target_plan, now)?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            current_plan = %current_plan.plan_type,
            target_plan = %target_plan.plan_type,
            amount_due = ?decision.amount_due(),
            "Quoted subscription upgrade"
        );

        Ok(UpgradeQuote {
            subscription,
            current_plan,
            target_plan,
            decision,
        })
    }

    /// Re-price the upgrade and record a payment order for the amount due.
    ///
    /// The subscription row is locked and its version bumped, so concurrent
    /// requests for the same subscription cannot both create an order.
    pub async fn create_upgrade_order(
        &self,
        user_id: Uuid,
        target_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentOrder> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, status, start_date, end_date, version
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription: ActiveSubscription = row
            .ok_or_else(|| {
                BillingError::NotFound(format!("No subscription for user {}", user_id))
            })?
            .try_into()?;

        let current_plan = fetch_plan(&mut *tx, subscription.plan_id).await?;
        let target_plan = fetch_plan(&mut *tx, target_plan_id).await?;

        let (amount, rationale) =
            match price_upgrade(&subscription, &current_plan, &target_plan, now)? {
                PricingDecision::Accepted {
                    amount_due,
                    rationale,
                    ..
                } => (amount_due, rationale),
                PricingDecision::Rejected { reason } => {
                    tracing::info!(
                        user_id = %user_id,
                        subscription_id = %subscription.id,
                        reason = %reason,
                        "Upgrade request rejected"
                    );
                    return Err(BillingError::UpgradeRejected(reason));
                }
            };

        let pending: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM payment_orders
                WHERE subscription_id = $1 AND status = 'created'
            )
            "#,
        )
        .bind(subscription.id)
        .fetch_one(&mut *tx)
        .await?;

        if pending {
            return Err(BillingError::UpgradeAlreadyPending);
        }

        bump_version(&mut *tx, subscription.id, subscription.version).await?;

        let order_row: PaymentOrderRow = sqlx::query_as(
            r#"
            INSERT INTO payment_orders (
                user_id, subscription_id, target_plan_id, amount, rationale, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'created', $6)
            RETURNING id, user_id, subscription_id, target_plan_id, amount, rationale,
                      status, created_at, paid_at
            "#,
        )
        .bind(user_id)
        .bind(subscription.id)
        .bind(target_plan.id)
        .bind(amount)
        .bind(&rationale)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let order = PaymentOrder::try_from(order_row)?;

        tracing::info!(
            user_id = %user_id,
            order_id = %order.id,
            subscription_id = %subscription.id,
            amount = %amount,
            "Created upgrade payment order"
        );

        Ok(order)
    }

    /// Apply a paid order: move the subscription to the target plan starting `now`
    pub async fn complete_upgrade_order(
        &self,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<CompletedUpgrade> {
        let mut tx = self.pool.begin().await?;

        let order_row: Option<PaymentOrderRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, subscription_id, target_plan_id, amount, rationale,
                   status, created_at, paid_at
            FROM payment_orders
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let order: PaymentOrder = order_row
            .ok_or_else(|| BillingError::NotFound(format!("Payment order {} not found", order_id)))?
            .try_into()?;

        if order.status != OrderStatus::Created {
            return Err(BillingError::InvalidOrderState(format!(
                "order {} is {}",
                order.id, order.status
            )));
        }

        let sub_row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, status, start_date, end_date, version
            FROM subscriptions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(order.subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription: ActiveSubscription = sub_row
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", order.subscription_id))
            })?
            .try_into()?;

        let target_plan = fetch_plan(&mut *tx, order.target_plan_id).await?;
        let end_date = now + Duration::days(target_plan.billing_cycle.period_days());

        let updated: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                plan_id = $1,
                status = 'active',
                start_date = $2,
                end_date = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $4 AND version = $5
            RETURNING id, user_id, plan_id, status, start_date, end_date, version
            "#,
        )
        .bind(target_plan.id)
        .bind(now)
        .bind(end_date)
        .bind(subscription.id)
        .bind(subscription.version)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription: ActiveSubscription = updated
            .ok_or_else(|| {
                BillingError::ConcurrentModification(
                    "Subscription was modified by another process. Please retry.".to_string(),
                )
            })?
            .try_into()?;

        let paid_row: PaymentOrderRow = sqlx::query_as(
            r#"
            UPDATE payment_orders SET status = 'paid', paid_at = $2
            WHERE id = $1
            RETURNING id, user_id, subscription_id, target_plan_id, amount, rationale,
                      status, created_at, paid_at
            "#,
        )
        .bind(order.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            subscription_id = %subscription.id,
            plan_id = %target_plan.id,
            end_date = %end_date,
            "Applied paid subscription upgrade"
        );

        Ok(CompletedUpgrade {
            order: paid_row.try_into()?,
            subscription,
        })
    }

    /// Withdraw an order that has not been paid
    pub async fn cancel_upgrade_order(&self, order_id: Uuid) -> BillingResult<PaymentOrder> {
        let row: Option<PaymentOrderRow> = sqlx::query_as(
            r#"
            UPDATE payment_orders SET status = 'cancelled'
            WHERE id = $1 AND status = 'created'
            RETURNING id, user_id, subscription_id, target_plan_id, amount, rationale,
                      status, created_at, paid_at
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            tracing::info!(order_id = %order_id, "Cancelled upgrade payment order");
            return row.try_into();
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM payment_orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(status) => Err(BillingError::InvalidOrderState(format!(
                "order {} is {}",
                order_id, status
            ))),
            None => Err(BillingError::NotFound(format!(
                "Payment order {} not found",
                order_id
            ))),
        }
    }

    /// Mark active subscriptions whose paid period ended before `now` as expired
    pub async fn expire_lapsed_subscriptions(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'expired',
                version = version + 1,
                updated_at = NOW()
            WHERE status = 'active' AND end_date < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if expired > 0 {
            tracing::info!(expired, "Expired lapsed subscriptions");
        }

        Ok(expired)
    }
}

async fn fetch_plan<'e, E>(executor: E, plan_id: Uuid) -> BillingResult<SubscriptionPlan>
where
    E: PgExecutor<'e>,
{
    let row: Option<PlanRow> = sqlx::query_as(
        "SELECT id, name, plan_type, billing_cycle, price FROM subscription_plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(executor)
    .await?;

    row.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))?
        .try_into()
}

/// Most recent subscription of any status, so inactive ones can be reported as such
async fn fetch_latest_subscription<'e, E>(
    executor: E,
    user_id: Uuid,
) -> BillingResult<ActiveSubscription>
where
    E: PgExecutor<'e>,
{
    let row: Option<SubscriptionRow> = sqlx::query_as(
        r#"
        SELECT id, user_id, plan_id, status, start_date, end_date, version
        FROM subscriptions
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;

    row.ok_or_else(|| BillingError::NotFound(format!("No subscription for user {}", user_id)))?
        .try_into()
}

async fn bump_version<'e, E>(executor: E, subscription_id: Uuid, version: i64) -> BillingResult<()>
where
    E: PgExecutor<'e>,
{
    let rows_affected = sqlx::query(
        r#"
        UPDATE subscriptions SET version = version + 1, updated_at = NOW()
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(subscription_id)
    .bind(version)
    .execute(executor)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(BillingError::ConcurrentModification(
            "Subscription was modified by another process. Please retry.".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use streamline_shared::{BillingCycle, PlanType};

    fn plan(plan_type: PlanType, billing_cycle: BillingCycle, price: i64) -> SubscriptionPlan {
        SubscriptionPlan {
            id: Uuid::new_v4(),
            name: format!("{} {}", plan_type, billing_cycle),
            plan_type,
            billing_cycle,
            price: Decimal::from(price),
        }
    }

    fn subscription(plan: &SubscriptionPlan, status: SubscriptionStatus) -> ActiveSubscription {
        let start = time::macros::datetime!(2026-01-01 00:00 UTC);
        ActiveSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: plan.id,
            status,
            start_date: start,
            end_date: start + Duration::days(30),
            version: 3,
        }
    }

    #[test]
    fn test_price_upgrade_requires_active_subscription() {
        let current = plan(PlanType::Basic, BillingCycle::Monthly, 199);
        let target = plan(PlanType::Advance, BillingCycle::Monthly, 499);
        let now = time::macros::datetime!(2026-01-03 00:00 UTC);

        for status in [
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Inactive,
        ] {
            let sub = subscription(&current, status);
            let err = price_upgrade(&sub, &current, &target, now).unwrap_err();
            assert!(
                matches!(err, BillingError::InvalidSubscriptionState(_)),
                "status {} should not be priced",
                status
            );
            assert!(err.to_string().starts_with("Cannot price upgrade"));
        }
    }

    #[test]
    fn test_price_upgrade_maps_input_errors() {
        let current = plan(PlanType::Basic, BillingCycle::Monthly, 199);
        let target = plan(PlanType::Advance, BillingCycle::Monthly, 499);
        let sub = subscription(&current, SubscriptionStatus::Active);
        let before_start = time::macros::datetime!(2025-12-31 00:00 UTC);

        let err = price_upgrade(&sub, &current, &target, before_start).unwrap_err();

        assert!(matches!(err, BillingError::InvalidUpgradeInput(_)));
    }

    #[test]
    fn test_price_upgrade_active_subscription() {
        let current = plan(PlanType::Basic, BillingCycle::Monthly, 199);
        let target = plan(PlanType::Advance, BillingCycle::Monthly, 499);
        let sub = subscription(&current, SubscriptionStatus::Active);
        let now = time::macros::datetime!(2026-01-03 00:00 UTC);

        let decision = price_upgrade(&sub, &current, &target, now).unwrap();

        assert_eq!(decision.amount_due(), Some(Decimal::from(300)));
    }

    #[test]
    fn test_upgrade_quote_serialization() {
        let current = plan(PlanType::Basic, BillingCycle::Monthly, 199);
        let target = plan(PlanType::Advance, BillingCycle::Monthly, 499);
        let sub = subscription(&current, SubscriptionStatus::Active);
        let now = time::macros::datetime!(2026-01-03 00:00 UTC);
        let decision = price_upgrade(&sub, &current, &target, now).unwrap();

        let quote = UpgradeQuote {
            subscription: sub,
            current_plan: current,
            target_plan: target,
            decision,
        };

        let json = serde_json::to_value(&quote).expect("Failed to serialize");
        assert_eq!(json["decision"]["decision"], "accepted");
        assert_eq!(json["current_plan"]["plan_type"], "basic");
        assert_eq!(json["target_plan"]["plan_type"], "advance");
        assert_eq!(json["subscription"]["start_date"], "2026-01-01T00:00:00Z");
    }
}
