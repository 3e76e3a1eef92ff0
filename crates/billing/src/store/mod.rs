//! Persistence seam for the billing engine
//!
//! [`BillingStore`] covers pool-level reads and the audit append.
//! [`BillingTx`] is one unit of work: rows read through it are locked until the
//! transaction ends, and nothing is visible to others until [`BillingTx::commit`].
//! Dropping a `BillingTx` without committing rolls it back.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use shiftledger_shared::Tenant;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditLogEntry;
use crate::entitlement::Entitlement;
use crate::error::BillingResult;
use crate::license_keys::LicenseKey;
use crate::subscriptions::Subscription;
use crate::webhooks::WebhookEventRecord;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Open a unit of work
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>>;

    /// Append one audit entry outside any transaction
    async fn append_audit_log(&self, entry: &AuditLogEntry) -> BillingResult<()>;

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Tenant>>;

    /// Tenants with `status = grace AND grace_until < now`
    async fn list_grace_expired_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<Tenant>>;

    /// Tenants with `status = pending_payment AND pending_expires_at < now`
    async fn list_pending_payment_expired_tenants(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Tenant>>;

    async fn count_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;

    /// All entitlements of a tenant, revoked ones included, oldest first
    async fn list_entitlements(&self, tenant_id: Uuid) -> BillingResult<Vec<Entitlement>>;

    async fn find_license_key(&self, key_id: Uuid) -> BillingResult<Option<LicenseKey>>;

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;
}

#[async_trait]
pub trait BillingTx: Send {
    /// Idempotency gate. Returns false if `(provider, event_id)` is already recorded.
    async fn insert_webhook_event(&mut self, event: &WebhookEventRecord) -> BillingResult<bool>;

    async fn lock_license_key_by_hash(&mut self, key_hash: &str)
        -> BillingResult<Option<LicenseKey>>;

    async fn lock_license_key(&mut self, key_id: Uuid) -> BillingResult<Option<LicenseKey>>;

    async fn insert_license_key(&mut self, key: &LicenseKey) -> BillingResult<()>;

    async fn update_license_key(&mut self, key: &LicenseKey) -> BillingResult<()>;

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()>;

    async fn lock_entitlement(&mut self, entitlement_id: Uuid)
        -> BillingResult<Option<Entitlement>>;

    async fn update_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()>;

    /// Non-revoked entitlements granted for `subscription_id`, locked
    async fn lock_subscription_entitlements(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>>;

    async fn lock_subscription(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()>;

    async fn update_subscription(&mut self, subscription: &Subscription) -> BillingResult<()>;

    async fn lock_tenant(&mut self, tenant_id: Uuid) -> BillingResult<Option<Tenant>>;

    async fn update_tenant(&mut self, tenant: &Tenant) -> BillingResult<()>;

    /// Hard-delete a tenant and its admin records. Returns the number of admins removed.
    async fn delete_tenant(&mut self, tenant_id: Uuid) -> BillingResult<u64>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;

    async fn rollback(self: Box<Self>) -> BillingResult<()>;
}
