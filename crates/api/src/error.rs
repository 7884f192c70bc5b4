//! API error types
//!
//! Maps billing errors onto the carrier contract: bad signatures are 401,
//! malformed payloads are 400, and only storage-layer failures become 500
//! so the provider retries exactly the deliveries that can succeed later.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use billhook_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Database(_) => {
                tracing::error!(error = %self, "Request failed with storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::AccountNotFound(_) => ApiError::NotFound,
            BillingError::UnknownPlan(plan) => {
                ApiError::Validation(format!("Unknown plan '{plan}'"))
            }
            BillingError::InvalidPayload(msg) => ApiError::Validation(msg),
            BillingError::Json(e) => ApiError::Validation(format!("Malformed payload: {e}")),
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billhook_billing::BillingError;
    use uuid::Uuid;

    fn status_for(error: BillingError) -> StatusCode {
        ApiError::from(error).into_response().status()
    }

    #[test]
    fn signature_failures_are_unauthorized() {
        assert_eq!(
            status_for(BillingError::WebhookSignatureInvalid),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn malformed_payloads_are_bad_requests() {
        assert_eq!(
            status_for(BillingError::InvalidPayload("no events".into())),
            StatusCode::BAD_REQUEST
        );
        #[allow(clippy::unwrap_used)]
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        assert_eq!(status_for(BillingError::Json(json_err)), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn storage_failures_invite_a_retry() {
        assert_eq!(
            status_for(BillingError::Database(sqlx::Error::PoolClosed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unknown_account_is_not_found() {
        assert_eq!(
            status_for(BillingError::AccountNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
    }
}
