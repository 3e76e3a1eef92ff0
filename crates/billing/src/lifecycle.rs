//! Scheduled tenant lifecycle jobs
//!
//! Each job selects its work from persisted state as of `now`, so re-running
//! one is harmless. Items are processed one transaction at a time and
//! re-checked under the row lock; a failure is counted and the loop moves on.
//! With `dry_run` the selection runs and nothing is written.

use std::sync::Arc;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditLogEntry, TargetType};
use crate::config::days_duration;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Audit reason for pending-payment deletions
pub const PENDING_PAYMENT_EXPIRED_REASON: &str = "pending_payment_expired";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraceExpiryResult {
    pub expired_tenants: Vec<Uuid>,
    pub suspended_count: usize,
    pub failed_count: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingPaymentCleanupResult {
    pub expired_tenants: Vec<Uuid>,
    pub deleted_count: usize,
    pub failed_count: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookCleanupResult {
    #[serde(with = "time::serde::rfc3339")]
    pub cutoff: OffsetDateTime,
    pub total_count: u64,
    pub deleted_count: u64,
    pub dry_run: bool,
}

/// What happened to one selected tenant
enum ItemOutcome {
    Done,
    /// Changed between selection and lock
    Skipped,
}

pub struct LifecycleBatchProcessor {
    store: Arc<dyn BillingStore>,
    audit: AuditLog,
}

impl LifecycleBatchProcessor {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        let audit = AuditLog::new(store.clone());
        Self { store, audit }
    }

    /// Suspend tenants whose grace period ended before `now`
    pub async fn run_grace_expiry_check(
        &self,
        now: OffsetDateTime,
        dry_run: bool,
    ) -> BillingResult<GraceExpiryResult> {
        let tenants = self.store.list_grace_expired_tenants(now).await?;
        let mut result = GraceExpiryResult {
            expired_tenants: tenants.iter().map(|t| t.id).collect(),
            dry_run,
            ..Default::default()
        };

        if dry_run {
            tracing::info!(
                total = result.expired_tenants.len(),
                "Grace expiry check (dry run): tenants would be suspended"
            );
            return Ok(result);
        }

        for tenant in &tenants {
            match self.suspend_tenant(tenant.id, now).await {
                Ok(ItemOutcome::Done) => result.suspended_count += 1,
                Ok(ItemOutcome::Skipped) => {
                    tracing::info!(
                        tenant_id = %tenant.id,
                        "Tenant no longer in expired grace, skipping"
                    );
                }
                Err(e) => {
                    result.failed_count += 1;
                    tracing::error!(
                        tenant_id = %tenant.id,
                        error = %e,
                        "Failed to suspend tenant"
                    );
                }
            }
        }

        tracing::info!(
            total = result.expired_tenants.len(),
            suspended = result.suspended_count,
            errors = result.failed_count,
            "Grace expiry check complete"
        );
        Ok(result)
    }

    pub async fn run_grace_expiry_check_now(&self, dry_run: bool) -> BillingResult<GraceExpiryResult> {
        self.run_grace_expiry_check(OffsetDateTime::now_utc(), dry_run)
            .await
    }

    async fn suspend_tenant(&self, tenant_id: Uuid, now: OffsetDateTime) -> BillingResult<ItemOutcome> {
        let mut tx = self.store.begin().await?;
        let mut tenant = match tx.lock_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_grace_expired(now) => tenant,
            _ => return Ok(ItemOutcome::Skipped),
        };

        let before = tenant.clone();
        tenant.suspend(now);
        tx.update_tenant(&tenant).await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            grace_until = ?before.grace_until,
            "Tenant suspended after grace period"
        );

        self.audit
            .record(
                AuditLogEntry::builder(AuditAction::TenantSuspended, TargetType::Tenant, tenant_id)
                    .before(&before)
                    .after(&tenant)
                    .build(now),
            )
            .await;

        Ok(ItemOutcome::Done)
    }

    /// Delete signups that never paid before `pending_expires_at`
    pub async fn run_pending_payment_cleanup(
        &self,
        now: OffsetDateTime,
        dry_run: bool,
    ) -> BillingResult<PendingPaymentCleanupResult> {
        let tenants = self.store.list_pending_payment_expired_tenants(now).await?;
        let mut result = PendingPaymentCleanupResult {
            expired_tenants: tenants.iter().map(|t| t.id).collect(),
            dry_run,
            ..Default::default()
        };

        if dry_run {
            tracing::info!(
                total = result.expired_tenants.len(),
                "Pending payment cleanup (dry run): tenants would be deleted"
            );
            return Ok(result);
        }

        for tenant in &tenants {
            match self.delete_pending_tenant(tenant.id, now).await {
                Ok(ItemOutcome::Done) => result.deleted_count += 1,
                Ok(ItemOutcome::Skipped) => {
                    tracing::info!(
                        tenant_id = %tenant.id,
                        "Tenant no longer pending payment, skipping"
                    );
                }
                Err(e) => {
                    result.failed_count += 1;
                    tracing::error!(
                        tenant_id = %tenant.id,
                        error = %e,
                        "Failed to delete expired pending tenant"
                    );
                }
            }
        }

        tracing::info!(
            total = result.expired_tenants.len(),
            deleted = result.deleted_count,
            errors = result.failed_count,
            "Pending payment cleanup complete"
        );
        Ok(result)
    }

    pub async fn run_pending_payment_cleanup_now(
        &self,
        dry_run: bool,
    ) -> BillingResult<PendingPaymentCleanupResult> {
        self.run_pending_payment_cleanup(OffsetDateTime::now_utc(), dry_run)
            .await
    }

    async fn delete_pending_tenant(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ItemOutcome> {
        let mut tx = self.store.begin().await?;
        let tenant = match tx.lock_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_pending_payment_expired(now) => tenant,
            _ => return Ok(ItemOutcome::Skipped),
        };

        let admins_deleted = tx.delete_tenant(tenant_id).await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            admins_deleted = admins_deleted,
            "Deleted tenant with expired pending payment"
        );

        self.audit
            .record(
                AuditLogEntry::builder(AuditAction::TenantDeleted, TargetType::Tenant, tenant_id)
                    .before(&tenant)
                    .data(serde_json::json!({
                        "reason": PENDING_PAYMENT_EXPIRED_REASON,
                        "pending_expires_at": tenant
                            .pending_expires_at
                            .and_then(|t| t.format(&Rfc3339).ok()),
                        "admins_deleted": admins_deleted,
                    }))
                    .build(now),
            )
            .await;

        Ok(ItemOutcome::Done)
    }

    /// Drop idempotency records received more than `retention_days` before `now`
    pub async fn run_webhook_cleanup(
        &self,
        now: OffsetDateTime,
        retention_days: i64,
        dry_run: bool,
    ) -> BillingResult<WebhookCleanupResult> {
        if retention_days < 1 {
            return Err(BillingError::InvalidInput(
                "retention_days must be at least 1".to_string(),
            ));
        }
        let cutoff = days_duration(retention_days)
            .and_then(|retention| now.checked_sub(retention))
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "retention_days {} is out of range",
                    retention_days
                ))
            })?;

        let total_count = self.store.count_webhook_events_before(cutoff).await?;
        let deleted_count = if dry_run || total_count == 0 {
            0
        } else {
            self.store.delete_webhook_events_before(cutoff).await?
        };

        tracing::info!(
            cutoff = %cutoff,
            total = total_count,
            deleted = deleted_count,
            dry_run = dry_run,
            "Webhook event cleanup complete"
        );

        Ok(WebhookCleanupResult {
            cutoff,
            total_count,
            deleted_count,
            dry_run,
        })
    }

    pub async fn run_webhook_cleanup_now(
        &self,
        retention_days: i64,
        dry_run: bool,
    ) -> BillingResult<WebhookCleanupResult> {
        self.run_webhook_cleanup(OffsetDateTime::now_utc(), retention_days, dry_run)
            .await
    }
}
