//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored value out of vocabulary: {0}")]
    StoredValue(#[from] billhook_shared::types::UnknownValue),

    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("account not found: {0}")]
    AccountNotFound(uuid::Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("email send failed: {0}")]
    EmailSend(String),
}

impl BillingError {
    /// True for the error classes a webhook response maps to 500, i.e. the
    /// ones where a provider retry can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }
}
