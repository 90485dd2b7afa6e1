//! Plan and subscription upgrade routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use streamline_billing::{ActiveSubscription, PaymentOrder, SubscriptionPlan, UpgradeQuote};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UpgradeQuoteQuery {
    pub target_plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub target_plan_id: Uuid,
}

/// GET /api/v1/plans
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriptionPlan>>> {
    let plans = state.billing.subscriptions.list_plans().await?;
    Ok(Json(plans))
}

/// GET /api/v1/users/{user_id}/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ActiveSubscription>> {
    let subscription = state
        .billing
        .subscriptions
        .get_active_subscription(user_id)
        .await?;
    Ok(Json(subscription))
}

/// GET /api/v1/users/{user_id}/subscription/upgrade-quote?target_plan_id=
///
/// A rejected upgrade is still a successful quote; the decision says why.
pub async fn upgrade_quote(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<UpgradeQuoteQuery>,
) -> ApiResult<Json<UpgradeQuote>> {
    let quote = state
        .billing
        .subscriptions
        .quote_upgrade(user_id, query.target_plan_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(quote))
}

/// POST /api/v1/users/{user_id}/subscription/upgrade
pub async fn create_upgrade(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpgradeRequest>,
) -> ApiResult<(StatusCode, Json<PaymentOrder>)> {
    let order = state
        .billing
        .subscriptions
        .create_upgrade_order(user_id, req.target_plan_id, OffsetDateTime::now_utc())
        .await?;

    tracing::info!(
        user_id = %user_id,
        order_id = %order.id,
        amount = %order.amount,
        "Upgrade order created"
    );

    Ok((StatusCode::CREATED, Json(order)))
}
