//! Internal order routes called by the payment collaborator
//!
//! Guarded by a shared token in the `X-Internal-Token` header.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use streamline_billing::{CompletedUpgrade, PaymentOrder};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

fn require_internal_token(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let expected = state.config.internal_api_token.as_bytes();
    if expected.is_empty() {
        return Err(ApiError::Unauthorized);
    }

    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .map(|v| v.as_bytes())
        .ok_or(ApiError::Unauthorized)?;

    if bool::from(provided.ct_eq(expected)) {
        Ok(())
    } else {
        tracing::warn!("Rejected internal request with invalid token");
        Err(ApiError::Unauthorized)
    }
}

/// POST /api/v1/internal/orders/{order_id}/complete
pub async fn complete_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<CompletedUpgrade>> {
    require_internal_token(&state, &headers)?;

    let completed = state
        .billing
        .subscriptions
        .complete_upgrade_order(order_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(completed))
}

/// POST /api/v1/internal/orders/{order_id}/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<PaymentOrder>> {
    require_internal_token(&state, &headers)?;

    let order = state
        .billing
        .subscriptions
        .cancel_upgrade_order(order_id)
        .await?;

    Ok(Json(order))
}
