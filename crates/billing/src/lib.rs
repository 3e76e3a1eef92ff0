// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::InvalidTransition carries both statuses
#![allow(clippy::too_many_arguments)] // Webhook helpers thread tx, snapshot, clock and audit buffer
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shiftledger Billing Module
//!
//! Billing and entitlement lifecycle for multi-tenant products.
//!
//! ## Features
//!
//! - **License Keys**: Issue, claim and revoke one-time keys for lifetime access
//! - **Entitlements**: Time-scoped access grants, derived or manual
//! - **Subscriptions**: Local mirror of provider subscriptions with a guarded state machine
//! - **Webhooks**: Signature-checked, idempotent provider event handling
//! - **Lifecycle Jobs**: Grace expiry, abandoned signup cleanup, webhook retention
//! - **Audit Log**: Best-effort before/after record of every change
//! - **Invariants**: Read-only consistency checks

pub mod audit;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod license_keys;
pub mod lifecycle;
pub mod store;
pub mod subscriptions;
pub mod webhooks;


// Audit
pub use audit::{ActorType, AuditAction, AuditLog, AuditLogEntry, AuditLogEntryBuilder, TargetType};

// Config
pub use config::{BillingConfig, STRIPE_PROVIDER};

// Entitlement
pub use entitlement::{Entitlement, EntitlementService, EntitlementSource};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// License Keys
pub use license_keys::{
    IssueKeysRequest, IssuedBatch, IssuedKey, LicenseKey, LicenseKeyService, LicenseKeyStatus,
};

// Lifecycle
pub use lifecycle::{
    GraceExpiryResult, LifecycleBatchProcessor, PendingPaymentCleanupResult, WebhookCleanupResult,
};

// Store
pub use store::{BillingStore, BillingTx, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionStatus};

// Webhooks
pub use webhooks::{
    WebhookAction, WebhookEnvelope, WebhookEventRecord, WebhookHandler, WebhookOutcome,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub license_keys: LicenseKeyService,
    pub entitlements: EntitlementService,
    pub webhooks: WebhookHandler,
    pub lifecycle: LifecycleBatchProcessor,
}

impl BillingService {
    /// Create a Postgres-backed billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(Arc::new(PgBillingStore::new(pool)), config))
    }

    /// Create a billing service over any store with explicit config
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self {
            license_keys: LicenseKeyService::new(store.clone(), &config),
            entitlements: EntitlementService::new(store.clone()),
            webhooks: WebhookHandler::new(store.clone(), config),
            lifecycle: LifecycleBatchProcessor::new(store),
        }
    }
}
