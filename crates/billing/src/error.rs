//! Billing error types

use thiserror::Error;

use crate::subscriptions::SubscriptionStatus;

/// Coarse classification of a [`BillingError`]
///
/// Callers map this onto their own response codes; batch jobs only care that
/// an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect
    Validation,
    /// The operation already happened or can no longer happen
    Conflict,
    /// Subscription status edge not in the transition table
    InvalidTransition,
    NotFound,
    /// Webhook signature rejected
    Unauthorized,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("License key has expired")]
    LicenseKeyExpired,

    #[error("License key has already been claimed")]
    LicenseKeyAlreadyClaimed,

    #[error("License key has been revoked")]
    LicenseKeyRevoked,

    #[error("Entitlement {0} is already revoked")]
    EntitlementAlreadyRevoked(uuid::Uuid),

    #[error("Invalid subscription status transition: {from} -> {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload rejected: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidInput(_) | BillingError::WebhookPayloadInvalid(_) => {
                ErrorKind::Validation
            }
            BillingError::LicenseKeyExpired
            | BillingError::LicenseKeyAlreadyClaimed
            | BillingError::LicenseKeyRevoked
            | BillingError::EntitlementAlreadyRevoked(_) => ErrorKind::Conflict,
            BillingError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::WebhookSignatureInvalid => ErrorKind::Unauthorized,
            BillingError::Config(_)
            | BillingError::Database(_)
            | BillingError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Serialization(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
