//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment signature verification failed")]
    SignatureInvalid,

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway request timed out")]
    GatewayTimeout,

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Outstanding payment must be resolved before changing plan")]
    PaymentRequired,

    #[error("Coupon not applicable: {0}")]
    CouponRejected(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a one-off checkout caller may safely retry the operation.
    ///
    /// Gateway timeouts and transient database failures are retryable
    /// because completion is idempotent; everything else needs caller or
    /// user action first.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_) | BillingError::GatewayTimeout | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::GatewayTimeout
        } else {
            BillingError::Gateway(err.to_string())
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
