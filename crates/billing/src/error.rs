//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("No active subscription for user {0}")]
    NoActiveSubscription(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedEvent(String),

    #[error("Invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),

    #[error("Owner VIP entries cannot be removed")]
    OwnerImmutable,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
