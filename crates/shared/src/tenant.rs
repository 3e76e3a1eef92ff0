//! Tenant lifecycle model
//!
//! A tenant is the unit of billing and access control. Tenants are created and
//! edited elsewhere; the billing engine only reads them and moves `status`
//! between lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle status of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Signed up, waiting for the first payment or key redemption
    PendingPayment,
    Active,
    /// Payment failed; access continues until `grace_until`
    Grace,
    Suspended,
    /// Soft-deleted
    Deleted,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::PendingPayment => "pending_payment",
            TenantStatus::Active => "active",
            TenantStatus::Grace => "grace",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tenant status '{0}'")]
pub struct ParseTenantStatusError(pub String);

impl FromStr for TenantStatus {
    type Err = ParseTenantStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(TenantStatus::PendingPayment),
            "active" => Ok(TenantStatus::Active),
            "grace" => Ok(TenantStatus::Grace),
            "suspended" => Ok(TenantStatus::Suspended),
            "deleted" => Ok(TenantStatus::Deleted),
            other => Err(ParseTenantStatusError(other.to_string())),
        }
    }
}

/// Tenant row as seen by the billing engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub status: TenantStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pending_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Tenant {
    /// New tenant awaiting payment until `pending_expires_at`
    pub fn pending_payment(
        name: impl Into<String>,
        pending_expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            status: TenantStatus::PendingPayment,
            grace_until: None,
            pending_expires_at: Some(pending_expires_at),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some() || self.status == TenantStatus::Deleted
    }

    /// `status = grace AND grace_until < now`
    pub fn is_grace_expired(&self, now: OffsetDateTime) -> bool {
        !self.is_deleted()
            && self.status == TenantStatus::Grace
            && self.grace_until.is_some_and(|until| until < now)
    }

    /// `status = pending_payment AND pending_expires_at < now`
    pub fn is_pending_payment_expired(&self, now: OffsetDateTime) -> bool {
        !self.is_deleted()
            && self.status == TenantStatus::PendingPayment
            && self.pending_expires_at.is_some_and(|expires| expires < now)
    }

    /// Restore access. Returns false if the tenant was already active.
    pub fn activate(&mut self, now: OffsetDateTime) -> bool {
        if self.status == TenantStatus::Active {
            return false;
        }
        self.status = TenantStatus::Active;
        self.grace_until = None;
        self.updated_at = now;
        true
    }

    /// Start the grace window. Only an active tenant enters grace.
    pub fn enter_grace(&mut self, now: OffsetDateTime, until: OffsetDateTime) -> bool {
        if self.status != TenantStatus::Active {
            return false;
        }
        self.status = TenantStatus::Grace;
        self.grace_until = Some(until);
        self.updated_at = now;
        true
    }

    pub fn suspend(&mut self, now: OffsetDateTime) {
        self.status = TenantStatus::Suspended;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn tenant(status: TenantStatus) -> Tenant {
        let now = datetime!(2026-03-01 00:00 UTC);
        Tenant {
            status,
            ..Tenant::pending_payment("Harbor Cafe", now + Duration::days(3), now)
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TenantStatus::PendingPayment,
            TenantStatus::Active,
            TenantStatus::Grace,
            TenantStatus::Suspended,
            TenantStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<TenantStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn test_grace_expiry_is_strictly_before_now() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let mut t = tenant(TenantStatus::Grace);

        t.grace_until = Some(now);
        assert!(!t.is_grace_expired(now));

        t.grace_until = Some(now - Duration::seconds(1));
        assert!(t.is_grace_expired(now));

        t.deleted_at = Some(now);
        assert!(!t.is_grace_expired(now));
    }

    #[test]
    fn test_pending_expiry_requires_pending_status() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let mut t = tenant(TenantStatus::PendingPayment);
        t.pending_expires_at = Some(now - Duration::days(1));
        assert!(t.is_pending_payment_expired(now));

        t.status = TenantStatus::Active;
        assert!(!t.is_pending_payment_expired(now));
    }

    #[test]
    fn test_enter_grace_only_from_active() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let until = now + Duration::days(7);

        let mut active = tenant(TenantStatus::Active);
        assert!(active.enter_grace(now, until));
        assert_eq!(active.status, TenantStatus::Grace);
        assert_eq!(active.grace_until, Some(until));

        let mut suspended = tenant(TenantStatus::Suspended);
        assert!(!suspended.enter_grace(now, until));
        assert_eq!(suspended.status, TenantStatus::Suspended);
    }

    #[test]
    fn test_activate_clears_grace() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let mut t = tenant(TenantStatus::Grace);
        t.grace_until = Some(now);

        assert!(t.activate(now));
        assert_eq!(t.status, TenantStatus::Active);
        assert!(t.grace_until.is_none());
        assert!(!t.activate(now));
    }

    #[test]
    fn test_serializes_status_snake_case() {
        let t = tenant(TenantStatus::PendingPayment);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["status"], "pending_payment");
    }
}
