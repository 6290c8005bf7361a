//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use truevault_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Payment gateway error")]
    Gateway(String),

    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::SignatureInvalid => {
                (StatusCode::FORBIDDEN, "Invalid signature".to_string())
            }
            // Provider detail goes to the log, not the caller.
            ApiError::Gateway(detail) => {
                tracing::error!(detail = %detail, "Payment gateway failure");
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string())
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidPlan(plan) => {
                ApiError::BadRequest(format!("Invalid plan: {plan}"))
            }
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::MalformedEvent(msg) => ApiError::BadRequest(msg),
            BillingError::UserNotFound(_) => ApiError::NotFound("User not found".to_string()),
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::NoActiveSubscription(_) => {
                ApiError::NotFound("No active subscription".to_string())
            }
            BillingError::OwnerImmutable => {
                ApiError::BadRequest("Owner VIP entries cannot be removed".to_string())
            }
            BillingError::SignatureInvalid => ApiError::SignatureInvalid,
            BillingError::Gateway(detail) => ApiError::Gateway(detail),
            BillingError::InvalidTransition(from, to) => {
                ApiError::Internal(format!("invalid transition {from} -> {to}"))
            }
            BillingError::Database(detail) | BillingError::Config(detail) => {
                ApiError::Internal(detail)
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn billing_errors_map_to_expected_statuses() {
        assert_eq!(
            status_of(BillingError::InvalidPlan("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::SignatureInvalid.into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(BillingError::Gateway("down".into()).into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BillingError::NoActiveSubscription(1).into()),
            StatusCode::NOT_FOUND
        );
    }
}
