//! Entitlements: grants of product access to a tenant
//!
//! Whether an entitlement is active is always computed from its timestamps;
//! there is no stored flag that could go stale. History is kept: entitlements
//! are revoked, never deleted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditLog, AuditLogEntry, TargetType};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// What funded an entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    /// License key redeemed at a booth
    Booth,
    /// Derived from a provider subscription
    Stripe,
    /// Granted by an operator
    Manual,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementSource::Booth => "booth",
            EntitlementSource::Stripe => "stripe",
            EntitlementSource::Manual => "manual",
        }
    }
}

impl fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementSource {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booth" => Ok(EntitlementSource::Booth),
            "stripe" => Ok(EntitlementSource::Stripe),
            "manual" => Ok(EntitlementSource::Manual),
            other => Err(BillingError::InvalidInput(format!(
                "unknown entitlement source '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub entitlement_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_code: String,
    pub source: EntitlementSource,
    /// Local subscription that keeps a `stripe` grant alive
    pub subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    /// `None` means lifetime
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Entitlement {
    pub fn new(
        tenant_id: Uuid,
        plan_code: impl Into<String>,
        source: EntitlementSource,
        starts_at: OffsetDateTime,
        ends_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            entitlement_id: Uuid::now_v7(),
            tenant_id,
            plan_code: plan_code.into(),
            source,
            subscription_id: None,
            starts_at,
            ends_at,
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lifetime grant starting now
    pub fn lifetime(
        tenant_id: Uuid,
        plan_code: impl Into<String>,
        source: EntitlementSource,
        now: OffsetDateTime,
    ) -> Self {
        Self::new(tenant_id, plan_code, source, now, None, now)
    }

    /// Tie the grant to the subscription that pays for it
    pub fn for_subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn is_lifetime(&self) -> bool {
        self.ends_at.is_none()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// `revoked_at == None && starts_at <= now && (ends_at == None || now <= ends_at)`
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.revoked_at.is_none()
            && now >= self.starts_at
            && self.ends_at.map_or(true, |ends_at| now <= ends_at)
    }

    /// Terminal. A second revoke is a conflict.
    pub fn revoke(&mut self, now: OffsetDateTime, reason: impl Into<String>) -> BillingResult<()> {
        if self.is_revoked() {
            return Err(BillingError::EntitlementAlreadyRevoked(self.entitlement_id));
        }
        self.revoked_at = Some(now);
        self.revoked_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    /// Overwrite `ends_at`. No lower-bound check: this can shorten a grant.
    pub fn extend_ends_at(&mut self, now: OffsetDateTime, new_ends_at: OffsetDateTime) {
        self.ends_at = Some(new_ends_at);
        self.updated_at = now;
    }
}

/// Operator-facing entitlement operations
pub struct EntitlementService {
    store: Arc<dyn BillingStore>,
    audit: AuditLog,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        let audit = AuditLog::new(store.clone());
        Self { store, audit }
    }

    /// Grant access by hand (support, partner deals)
    pub async fn grant_manual(
        &self,
        tenant_id: Uuid,
        plan_code: &str,
        starts_at: OffsetDateTime,
        ends_at: Option<OffsetDateTime>,
        actor: ActorType,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        if plan_code.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "plan_code must not be empty".to_string(),
            ));
        }
        if ends_at.is_some_and(|ends_at| ends_at < starts_at) {
            return Err(BillingError::InvalidInput(
                "ends_at must not be before starts_at".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let tenant = tx.lock_tenant(tenant_id).await?;
        if !tenant.is_some_and(|t| !t.is_deleted()) {
            return Err(BillingError::NotFound(format!("Tenant {} not found", tenant_id)));
        }

        let entitlement = Entitlement::new(
            tenant_id,
            plan_code,
            EntitlementSource::Manual,
            starts_at,
            ends_at,
            now,
        );
        tx.insert_entitlement(&entitlement).await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            entitlement_id = %entitlement.entitlement_id,
            plan_code = %plan_code,
            "Manual entitlement granted"
        );

        self.audit
            .record(
                AuditLogEntry::builder(
                    AuditAction::EntitlementGranted,
                    TargetType::Entitlement,
                    entitlement.entitlement_id,
                )
                .actor(actor)
                .after(&entitlement)
                .build(now),
            )
            .await;

        Ok(entitlement)
    }

    /// Revoke one entitlement. Does not touch the tenant or any license key.
    pub async fn revoke(
        &self,
        entitlement_id: Uuid,
        reason: &str,
        actor: ActorType,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.store.begin().await?;
        let mut entitlement = tx.lock_entitlement(entitlement_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Entitlement {} not found", entitlement_id))
        })?;

        let before = entitlement.clone();
        entitlement.revoke(now, reason)?;
        tx.update_entitlement(&entitlement).await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %entitlement.tenant_id,
            entitlement_id = %entitlement_id,
            reason = %reason,
            "Entitlement revoked"
        );

        self.audit
            .record(
                AuditLogEntry::builder(
                    AuditAction::EntitlementRevoked,
                    TargetType::Entitlement,
                    entitlement_id,
                )
                .actor(actor)
                .before(&before)
                .after(&entitlement)
                .build(now),
            )
            .await;

        Ok(entitlement)
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<Entitlement>> {
        self.store.list_entitlements(tenant_id).await
    }

    pub async fn has_active_entitlement(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        Ok(self
            .store
            .list_entitlements(tenant_id)
            .await?
            .iter()
            .any(|e| e.is_active(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn bounded() -> Entitlement {
        Entitlement::new(
            Uuid::now_v7(),
            "standard",
            EntitlementSource::Stripe,
            datetime!(2026-01-01 00:00 UTC),
            Some(datetime!(2026-02-01 00:00 UTC)),
            datetime!(2026-01-01 00:00 UTC),
        )
    }

    #[test]
    fn test_active_window_is_inclusive() {
        let e = bounded();
        assert!(!e.is_active(datetime!(2025-12-31 23:59:59 UTC)));
        assert!(e.is_active(datetime!(2026-01-01 00:00 UTC)));
        assert!(e.is_active(datetime!(2026-02-01 00:00 UTC)));
        assert!(!e.is_active(datetime!(2026-02-01 00:00:01 UTC)));
    }

    #[test]
    fn test_lifetime_never_ends() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let e = Entitlement::lifetime(Uuid::now_v7(), "lifetime", EntitlementSource::Booth, now);
        assert!(e.is_lifetime());
        assert!(e.is_active(now + Duration::days(365 * 50)));
    }

    #[test]
    fn test_revoked_is_inactive_at_any_time() {
        let mut e = bounded();
        e.revoke(datetime!(2026-01-15 00:00 UTC), "chargeback").unwrap();

        for at in [
            datetime!(2025-06-01 00:00 UTC),
            datetime!(2026-01-10 00:00 UTC),
            datetime!(2026-01-20 00:00 UTC),
            datetime!(2030-01-01 00:00 UTC),
        ] {
            assert!(!e.is_active(at));
        }

        // Extending a revoked grant does not bring it back
        e.extend_ends_at(datetime!(2026-01-16 00:00 UTC), datetime!(2027-01-01 00:00 UTC));
        assert!(!e.is_active(datetime!(2026-06-01 00:00 UTC)));
    }

    #[test]
    fn test_second_revoke_conflicts() {
        let mut e = bounded();
        e.revoke(datetime!(2026-01-15 00:00 UTC), "first").unwrap();
        let err = e.revoke(datetime!(2026-01-16 00:00 UTC), "second").unwrap_err();
        assert!(matches!(err, BillingError::EntitlementAlreadyRevoked(_)));
        assert_eq!(e.revoked_reason.as_deref(), Some("first"));
    }

    #[test]
    fn test_extend_can_shorten() {
        let mut e = bounded();
        let earlier = datetime!(2026-01-10 00:00 UTC);
        e.extend_ends_at(datetime!(2026-01-05 00:00 UTC), earlier);
        assert_eq!(e.ends_at, Some(earlier));
    }

    #[test]
    fn test_source_strings() {
        for source in [
            EntitlementSource::Booth,
            EntitlementSource::Stripe,
            EntitlementSource::Manual,
        ] {
            assert_eq!(source.as_str().parse::<EntitlementSource>().unwrap(), source);
        }
    }
}
