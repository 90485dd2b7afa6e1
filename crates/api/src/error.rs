//! API error type and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use streamline_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    /// Request conflicts with the current subscription or order state
    #[error("{0}")]
    Conflict(String),

    /// The pricing policy does not allow the requested upgrade
    #[error("{0}")]
    UpgradeRejected(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpgradeRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Database(detail) => {
                tracing::error!(error = %detail, "Database error while handling request");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::UpgradeRejected(reason) => ApiError::UpgradeRejected(reason),
            BillingError::InvalidSubscriptionState(_)
            | BillingError::InvalidUpgradeInput(_)
            | BillingError::UpgradeAlreadyPending
            | BillingError::ConcurrentModification(_)
            | BillingError::InvalidOrderState(_) => ApiError::Conflict(e.to_string()),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::CorruptRecord(msg) => {
                tracing::error!(error = %msg, "Corrupt billing record");
                ApiError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamline_billing::{UpgradeInputError, INVALID_UPGRADE_PATH};

    #[test]
    fn test_billing_error_mapping() {
        let cases = [
            (
                BillingError::NotFound("Plan x not found".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                BillingError::UpgradeRejected(INVALID_UPGRADE_PATH.into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                BillingError::InvalidSubscriptionState("expired".into()),
                StatusCode::CONFLICT,
            ),
            (BillingError::UpgradeAlreadyPending, StatusCode::CONFLICT),
            (
                BillingError::ConcurrentModification("retry".into()),
                StatusCode::CONFLICT,
            ),
            (
                BillingError::Database("connection reset".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::CorruptRecord("bad status".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (billing_error, status) in cases {
            assert_eq!(ApiError::from(billing_error).status(), status);
        }
    }

    #[test]
    fn test_invalid_input_keeps_cannot_price_message() {
        let err = ApiError::from(BillingError::InvalidUpgradeInput(
            UpgradeInputError::StartDateInFuture {
                start_date: time::OffsetDateTime::UNIX_EPOCH + time::Duration::days(1),
                now: time::OffsetDateTime::UNIX_EPOCH,
            },
        ));

        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.to_string().starts_with("Cannot price upgrade"));
    }

    #[tokio::test]
    async fn test_database_error_body_hides_detail() {
        let response =
            ApiError::from(BillingError::Database("password authentication failed".into()))
                .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["code"], 500);
    }

    #[test]
    fn test_rejected_upgrade_message_is_the_reason() {
        let err = ApiError::from(BillingError::UpgradeRejected(INVALID_UPGRADE_PATH.into()));
        assert_eq!(err.to_string(), INVALID_UPGRADE_PATH);
    }
}
