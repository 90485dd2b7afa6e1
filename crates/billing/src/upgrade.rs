//! Upgrade pricing
//!
//! Decides what a subscriber pays to move from their current plan to a target
//! plan. The calculation is pure: every input, including the current time, is
//! passed in, and nothing is read from or written to storage.
//!
//! ## Policy
//!
//! - Only `basic -> advance` is an upgrade. Anything else is rejected.
//! - Within [`GRACE_PERIOD_DAYS`] of the subscription start, only the price
//!   delta is charged.
//! - After the grace window, monthly plans pay the current plan again plus the
//!   full new plan.
//! - After the grace window, yearly plans get the unused part of the year back
//!   as a credit against the new plan. Elapsed time is counted in
//!   [`PRORATION_MONTH_DAYS`]-day months, not calendar months.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use streamline_shared::{BillingCycle, PlanType};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{ActiveSubscription, SubscriptionPlan};

/// Days after the subscription start during which an upgrade costs only the price delta
pub const GRACE_PERIOD_DAYS: i64 = 5;

/// Length of a "month" when prorating yearly plans.
///
/// Deliberately not calendar aware and not a twelfth of 365 days. Twelve of
/// these months is 360 days, so a yearly subscriber can accrue a 13th month.
pub const PRORATION_MONTH_DAYS: i64 = 30;

/// Months in a yearly billing cycle
const MONTHS_PER_YEAR: i64 = 12;

/// Decimal places kept on amounts due (currency minor units)
const AMOUNT_SCALE: u32 = 2;

pub const INVALID_UPGRADE_PATH: &str =
    "Invalid upgrade path. Can only upgrade from Basic to Advance.";

/// Outcome of pricing an upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PricingDecision {
    Accepted {
        /// Never negative
        amount_due: Decimal,
        rationale: String,
        days_since_subscription_start: i64,
    },
    Rejected {
        reason: String,
    },
}

impl PricingDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PricingDecision::Accepted { .. })
    }

    pub fn amount_due(&self) -> Option<Decimal> {
        match self {
            PricingDecision::Accepted { amount_due, .. } => Some(*amount_due),
            PricingDecision::Rejected { .. } => None,
        }
    }

    fn accepted(amount_due: Decimal, rationale: String, days: i64) -> Self {
        PricingDecision::Accepted {
            amount_due: amount_due
                .max(Decimal::ZERO)
                .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero),
            rationale,
            days_since_subscription_start: days,
        }
    }
}

/// Inputs the engine refuses to price
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeInputError {
    #[error("subscription references plan {subscription_plan_id} but plan {plan_id} was supplied")]
    PlanMismatch {
        subscription_plan_id: Uuid,
        plan_id: Uuid,
    },

    #[error("plan {plan_id} has a negative price ({price})")]
    NegativePrice { plan_id: Uuid, price: Decimal },

    #[error("subscription starts at {start_date}, after the pricing time {now}")]
    StartDateInFuture {
        start_date: OffsetDateTime,
        now: OffsetDateTime,
    },
}

/// Stateless upgrade price calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradePricingEngine;

impl UpgradePricingEngine {
    /// Price moving `subscription` from `current_plan` to `target_plan` at `now`.
    ///
    /// A disallowed transition is a [`PricingDecision::Rejected`], not an error.
    /// Errors are reserved for inputs that cannot describe a real subscription.
    pub fn quote(
        subscription: &ActiveSubscription,
        current_plan: &SubscriptionPlan,
        target_plan: &SubscriptionPlan,
        now: OffsetDateTime,
    ) -> Result<PricingDecision, UpgradeInputError> {
        if subscription.plan_id != current_plan.id {
            return Err(UpgradeInputError::PlanMismatch {
                subscription_plan_id: subscription.plan_id,
                plan_id: current_plan.id,
            });
        }

        if current_plan.plan_type != PlanType::Basic || target_plan.plan_type != PlanType::Advance
        {
            return Ok(PricingDecision::Rejected {
                reason: INVALID_UPGRADE_PATH.to_string(),
            });
        }

        for plan in [current_plan, target_plan] {
            if plan.price < Decimal::ZERO {
                return Err(UpgradeInputError::NegativePrice {
                    plan_id: plan.id,
                    price: plan.price,
                });
            }
        }

        let days = days_since_start(subscription.start_date, now)?;

        Ok(Self::price(
            current_plan.billing_cycle,
            current_plan.price,
            target_plan.price,
            days,
        ))
    }

    /// Apply the pricing policy to already validated values
    fn price(
        cycle: BillingCycle,
        current_price: Decimal,
        target_price: Decimal,
        days: i64,
    ) -> PricingDecision {
        if days <= GRACE_PERIOD_DAYS {
            return PricingDecision::accepted(
                target_price - current_price,
                format!("Free upgrade within {} days", GRACE_PERIOD_DAYS),
                days,
            );
        }

        match cycle {
            BillingCycle::Monthly => PricingDecision::accepted(
                current_price + target_price,
                format!(
                    "Upgrade after {} days: current month charge + new plan",
                    GRACE_PERIOD_DAYS
                ),
                days,
            ),
            BillingCycle::Yearly => {
                let months_used = days / PRORATION_MONTH_DAYS;
                // Multiply before dividing so whole-unit yearly prices stay exact
                let used_amount =
                    Decimal::from(months_used) * current_price / Decimal::from(MONTHS_PER_YEAR);
                // Can go negative past twelve months; only the final amount is clamped
                let refundable_amount = current_price - used_amount;

                PricingDecision::accepted(
                    target_price - refundable_amount,
                    format!(
                        "Yearly upgrade: used {} months, refund applied",
                        months_used
                    ),
                    days,
                )
            }
        }
    }
}

/// Whole 24-hour periods between `start_date` and `now`
pub fn days_since_start(
    start_date: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<i64, UpgradeInputError> {
    if start_date > now {
        return Err(UpgradeInputError::StartDateInFuture { start_date, now });
    }
    Ok((now - start_date).whole_days())
}
