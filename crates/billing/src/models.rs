//! Billing records and their database row shapes
//!
//! Rows come out of Postgres with plain `TEXT` columns. They are converted into
//! the typed records below before any pricing logic sees them, so a stray
//! value in the database surfaces as [`BillingError::CorruptRecord`] instead of
//! a wrong price.

use rust_decimal::Decimal;
use serde::Serialize;
use streamline_shared::{BillingCycle, OrderStatus, PlanType, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Plan catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub plan_type: PlanType,
    pub billing_cycle: BillingCycle,
    pub price: Decimal,
}

/// A user's subscription as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    /// Optimistic lock counter, bumped on every write
    pub version: i64,
}

/// A charge created from an accepted upgrade quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub target_plan_id: Uuid,
    pub amount: Decimal,
    pub rationale: String,
    pub status: OrderStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PlanRow {
    pub id: Uuid,
    pub name: String,
    pub plan_type: String,
    pub billing_cycle: String,
    pub price: Decimal,
}

impl TryFrom<PlanRow> for SubscriptionPlan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            plan_type: row.plan_type.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            price: row.price,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub version: i64,
}

impl TryFrom<SubscriptionRow> for ActiveSubscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PaymentOrderRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub target_plan_id: Uuid,
    pub amount: Decimal,
    pub rationale: String,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentOrderRow> for PaymentOrder {
    type Error = BillingError;

    fn try_from(row: PaymentOrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            target_plan_id: row.target_plan_id,
            amount: row.amount,
            rationale: row.rationale,
            status: row.status.parse()?,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_row(plan_type: &str, billing_cycle: &str) -> PlanRow {
        PlanRow {
            id: Uuid::new_v4(),
            name: "Basic Monthly".to_string(),
            plan_type: plan_type.to_string(),
            billing_cycle: billing_cycle.to_string(),
            price: Decimal::new(199, 0),
        }
    }

    #[test]
    fn test_plan_row_converts() {
        let plan = SubscriptionPlan::try_from(plan_row("basic", "monthly")).unwrap();
        assert_eq!(plan.plan_type, PlanType::Basic);
        assert_eq!(plan.billing_cycle, BillingCycle::Monthly);
        assert_eq!(plan.price, Decimal::new(199, 0));
    }

    #[test]
    fn test_plan_row_with_unknown_type_is_corrupt() {
        let err = SubscriptionPlan::try_from(plan_row("premium", "monthly")).unwrap_err();
        assert!(matches!(err, BillingError::CorruptRecord(_)));
    }

    #[test]
    fn test_subscription_row_with_unknown_status_is_corrupt() {
        let now = OffsetDateTime::now_utc();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: "paused".to_string(),
            start_date: now,
            end_date: now,
            version: 0,
        };
        let err = ActiveSubscription::try_from(row).unwrap_err();
        assert!(err.to_string().contains("invalid subscription status 'paused'"));
    }

    #[test]
    fn test_payment_order_serialization() {
        let order = PaymentOrder {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            target_plan_id: Uuid::new_v4(),
            amount: Decimal::new(300, 0),
            rationale: "Free upgrade within 5 days".to_string(),
            status: OrderStatus::Created,
            created_at: OffsetDateTime::UNIX_EPOCH,
            paid_at: None,
        };

        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "created");
        assert_eq!(json["amount"], "300");
        assert_eq!(json["created_at"], "1970-01-01T00:00:00Z");
        assert!(json["paid_at"].is_null());
    }
}
