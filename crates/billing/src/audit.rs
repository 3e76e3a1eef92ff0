//! Billing audit log
//!
//! Every state change made by the engine is documented by an append-only
//! [`AuditLogEntry`]. Entries are written *after* the state change commits, by
//! [`AuditLog::record`], which never returns an error: a failed audit write is
//! logged at warn level and dropped. The audit trail may therefore have gaps;
//! billing state never waits on it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::BillingStore;

/// Who initiated the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Scheduled batch job
    System,
    /// Payment provider webhook
    Provider,
    /// Support staff or operator CLI
    Operator,
    /// The tenant itself (e.g. redeeming a key)
    Tenant,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Provider => "provider",
            ActorType::Operator => "operator",
            ActorType::Tenant => "tenant",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LicenseKeysIssued,
    LicenseKeyClaimed,
    LicenseKeyRevoked,
    EntitlementGranted,
    EntitlementExtended,
    EntitlementRevoked,
    SubscriptionCreated,
    SubscriptionUpdated,
    TenantActivated,
    TenantGraceStarted,
    TenantSuspended,
    TenantDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LicenseKeysIssued => "license_keys_issued",
            AuditAction::LicenseKeyClaimed => "license_key_claimed",
            AuditAction::LicenseKeyRevoked => "license_key_revoked",
            AuditAction::EntitlementGranted => "entitlement_granted",
            AuditAction::EntitlementExtended => "entitlement_extended",
            AuditAction::EntitlementRevoked => "entitlement_revoked",
            AuditAction::SubscriptionCreated => "subscription_created",
            AuditAction::SubscriptionUpdated => "subscription_updated",
            AuditAction::TenantActivated => "tenant_activated",
            AuditAction::TenantGraceStarted => "tenant_grace_started",
            AuditAction::TenantSuspended => "tenant_suspended",
            AuditAction::TenantDeleted => "tenant_deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    LicenseKey,
    LicenseKeyBatch,
    Entitlement,
    Subscription,
    Tenant,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::LicenseKey => "license_key",
            TargetType::LicenseKeyBatch => "license_key_batch",
            TargetType::Entitlement => "entitlement",
            TargetType::Subscription => "subscription",
            TargetType::Tenant => "tenant",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub log_id: Uuid,
    pub actor_type: ActorType,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: String,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AuditLogEntry {
    pub fn builder(
        action: AuditAction,
        target_type: TargetType,
        target_id: impl ToString,
    ) -> AuditLogEntryBuilder {
        AuditLogEntryBuilder {
            actor_type: ActorType::System,
            action,
            target_type,
            target_id: target_id.to_string(),
            before_json: None,
            after_json: None,
        }
    }
}

/// Builder for [`AuditLogEntry`]; the actor defaults to [`ActorType::System`]
#[derive(Debug, Clone)]
pub struct AuditLogEntryBuilder {
    actor_type: ActorType,
    action: AuditAction,
    target_type: TargetType,
    target_id: String,
    before_json: Option<serde_json::Value>,
    after_json: Option<serde_json::Value>,
}

impl AuditLogEntryBuilder {
    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn before<T: Serialize>(mut self, snapshot: &T) -> Self {
        self.before_json = snapshot_json(snapshot);
        self
    }

    pub fn after<T: Serialize>(mut self, snapshot: &T) -> Self {
        self.after_json = snapshot_json(snapshot);
        self
    }

    /// Attach a free-form payload as the "after" snapshot
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.after_json = Some(data);
        self
    }

    pub fn build(self, now: OffsetDateTime) -> AuditLogEntry {
        AuditLogEntry {
            log_id: Uuid::now_v7(),
            actor_type: self.actor_type,
            action: self.action,
            target_type: self.target_type,
            target_id: self.target_id,
            before_json: self.before_json,
            after_json: self.after_json,
            created_at: now,
        }
    }
}

fn snapshot_json<T: Serialize>(snapshot: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(snapshot) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize audit snapshot");
            None
        }
    }
}

/// Best-effort audit writer
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn BillingStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Append one entry. Call only after the change it documents has committed.
    pub async fn record(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.append_audit_log(&entry).await {
            tracing::warn!(
                error = %e,
                log_id = %entry.log_id,
                action = %entry.action,
                target_type = %entry.target_type,
                target_id = %entry.target_id,
                "Failed to write billing audit log entry"
            );
        }
    }

    pub async fn record_all(&self, entries: Vec<AuditLogEntry>) {
        for entry in entries {
            self.record(entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;
    use time::macros::datetime;

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let entry = AuditLogEntry::builder(
            AuditAction::TenantSuspended,
            TargetType::Tenant,
            "tenant-1",
        )
        .build(datetime!(2026-01-01 00:00 UTC));

        assert_eq!(entry.actor_type, ActorType::System);
        assert_eq!(entry.target_id, "tenant-1");
        assert!(entry.before_json.is_none());
        assert!(entry.after_json.is_none());
    }

    #[test]
    fn test_snapshots_are_json() {
        let entry = AuditLogEntry::builder(
            AuditAction::TenantDeleted,
            TargetType::Tenant,
            Uuid::nil(),
        )
        .actor(ActorType::Operator)
        .before(&serde_json::json!({"status": "pending_payment"}))
        .data(serde_json::json!({"reason": "pending_payment_expired"}))
        .build(datetime!(2026-01-01 00:00 UTC));

        assert_eq!(entry.before_json.unwrap()["status"], "pending_payment");
        assert_eq!(entry.after_json.unwrap()["reason"], "pending_payment_expired");
        assert_eq!(entry.target_id, Uuid::nil().to_string());
    }

    #[test]
    fn test_action_strings_are_snake_case() {
        assert_eq!(AuditAction::LicenseKeyClaimed.as_str(), "license_key_claimed");
        assert_eq!(
            serde_json::to_value(AuditAction::TenantGraceStarted).unwrap(),
            "tenant_grace_started"
        );
    }

    #[tokio::test]
    async fn test_record_swallows_store_failure() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.fail_audit_writes(true);
        let audit = AuditLog::new(store.clone());

        audit
            .record(
                AuditLogEntry::builder(AuditAction::TenantSuspended, TargetType::Tenant, "t")
                    .build(datetime!(2026-01-01 00:00 UTC)),
            )
            .await;

        assert!(store.audit_entries().await.is_empty());
    }
}
