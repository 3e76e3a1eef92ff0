//! In-process [`BillingStore`]
//!
//! A transaction takes the store-wide lock and works on a copy of the state;
//! commit publishes the copy, drop throws it away. Units of work are therefore
//! fully serialised. Do not call [`BillingStore`] methods on the same store
//! while holding one of its transactions in the same task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use shiftledger_shared::Tenant;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{BillingStore, BillingTx};
use crate::audit::AuditLogEntry;
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::license_keys::LicenseKey;
use crate::subscriptions::Subscription;
use crate::webhooks::WebhookEventRecord;

#[derive(Debug, Clone)]
struct TenantAdmin {
    tenant_id: Uuid,
}

#[derive(Debug, Clone, Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    tenant_admins: HashMap<Uuid, TenantAdmin>,
    license_keys: HashMap<Uuid, LicenseKey>,
    entitlements: HashMap<Uuid, Entitlement>,
    subscriptions: HashMap<String, Subscription>,
    webhook_events: HashMap<(String, String), WebhookEventRecord>,
    audit_logs: Vec<AuditLogEntry>,
    failing_tenants: HashSet<Uuid>,
}

impl State {
    fn entitlements_for(&self, tenant_id: Uuid) -> Vec<Entitlement> {
        let mut found: Vec<Entitlement> = self
            .entitlements
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.created_at, e.entitlement_id));
        found
    }
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Arc<Mutex<State>>,
    fail_audit_writes: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit append fail until switched off
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every row lock on this tenant fail with a database error
    pub async fn fail_tenant(&self, tenant_id: Uuid) {
        self.state.lock().await.failing_tenants.insert(tenant_id);
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.lock().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_tenant_admin(&self, tenant_id: Uuid) -> Uuid {
        let admin_id = Uuid::now_v7();
        self.state
            .lock()
            .await
            .tenant_admins
            .insert(admin_id, TenantAdmin { tenant_id });
        admin_id
    }

    pub async fn insert_license_key(&self, key: LicenseKey) {
        self.state.lock().await.license_keys.insert(key.key_id, key);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.provider_subscription_id.clone(), subscription);
    }

    pub async fn insert_webhook_event(&self, event: WebhookEventRecord) {
        self.state
            .lock()
            .await
            .webhook_events
            .insert((event.provider.clone(), event.event_id.clone()), event);
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> Option<Tenant> {
        self.state.lock().await.tenants.get(&tenant_id).cloned()
    }

    pub async fn license_key_by_hash(&self, key_hash: &str) -> Option<LicenseKey> {
        self.state
            .lock()
            .await
            .license_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned()
    }

    pub async fn subscription(&self, provider_subscription_id: &str) -> Option<Subscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(provider_subscription_id)
            .cloned()
    }

    pub async fn entitlements(&self, tenant_id: Uuid) -> Vec<Entitlement> {
        self.state.lock().await.entitlements_for(tenant_id)
    }

    pub async fn tenant_admin_count(&self, tenant_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .tenant_admins
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .count()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.state.lock().await.webhook_events.len()
    }

    pub async fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.state.lock().await.audit_logs.clone()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx { guard, working }))
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> BillingResult<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "audit log unavailable (injected)".to_string(),
            ));
        }
        self.state.lock().await.audit_logs.push(entry.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Tenant>> {
        Ok(self.tenant(tenant_id).await)
    }

    async fn list_grace_expired_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<Tenant>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state
            .tenants
            .values()
            .filter(|t| t.is_grace_expired(now))
            .cloned()
            .collect();
        tenants.sort_by_key(|t| (t.grace_until, t.id));
        Ok(tenants)
    }

    async fn list_pending_payment_expired_tenants(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Tenant>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state
            .tenants
            .values()
            .filter(|t| t.is_pending_payment_expired(now))
            .cloned()
            .collect();
        tenants.sort_by_key(|t| (t.pending_expires_at, t.id));
        Ok(tenants)
    }

    async fn count_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .webhook_events
            .values()
            .filter(|e| e.received_at < cutoff)
            .count() as u64)
    }

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.webhook_events.len();
        state.webhook_events.retain(|_, e| e.received_at >= cutoff);
        Ok((before - state.webhook_events.len()) as u64)
    }

    async fn list_entitlements(&self, tenant_id: Uuid) -> BillingResult<Vec<Entitlement>> {
        Ok(self.entitlements(tenant_id).await)
    }

    async fn find_license_key(&self, key_id: Uuid) -> BillingResult<Option<LicenseKey>> {
        Ok(self.state.lock().await.license_keys.get(&key_id).cloned())
    }

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.subscription(provider_subscription_id).await)
    }
}

struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl BillingTx for InMemoryTx {
    async fn insert_webhook_event(&mut self, event: &WebhookEventRecord) -> BillingResult<bool> {
        let key = (event.provider.clone(), event.event_id.clone());
        if self.working.webhook_events.contains_key(&key) {
            return Ok(false);
        }
        self.working.webhook_events.insert(key, event.clone());
        Ok(true)
    }

    async fn lock_license_key_by_hash(
        &mut self,
        key_hash: &str,
    ) -> BillingResult<Option<LicenseKey>> {
        Ok(self
            .working
            .license_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn lock_license_key(&mut self, key_id: Uuid) -> BillingResult<Option<LicenseKey>> {
        Ok(self.working.license_keys.get(&key_id).cloned())
    }

    async fn insert_license_key(&mut self, key: &LicenseKey) -> BillingResult<()> {
        if self
            .working
            .license_keys
            .values()
            .any(|k| k.key_hash == key.key_hash)
        {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint on key_hash".to_string(),
            ));
        }
        self.working.license_keys.insert(key.key_id, key.clone());
        Ok(())
    }

    async fn update_license_key(&mut self, key: &LicenseKey) -> BillingResult<()> {
        match self.working.license_keys.get_mut(&key.key_id) {
            Some(row) => {
                *row = key.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "License key {} not found",
                key.key_id
            ))),
        }
    }

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        self.working
            .entitlements
            .insert(entitlement.entitlement_id, entitlement.clone());
        Ok(())
    }

    async fn lock_entitlement(
        &mut self,
        entitlement_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        Ok(self.working.entitlements.get(&entitlement_id).cloned())
    }

    async fn update_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        match self.working.entitlements.get_mut(&entitlement.entitlement_id) {
            Some(row) => {
                *row = entitlement.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "Entitlement {} not found",
                entitlement.entitlement_id
            ))),
        }
    }

    async fn lock_subscription_entitlements(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>> {
        let mut found: Vec<Entitlement> = self
            .working
            .entitlements
            .values()
            .filter(|e| e.subscription_id == Some(subscription_id) && !e.is_revoked())
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.created_at, e.entitlement_id));
        Ok(found)
    }

    async fn lock_subscription(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .get(provider_subscription_id)
            .cloned())
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        if self
            .working
            .subscriptions
            .contains_key(&subscription.provider_subscription_id)
        {
            return Err(BillingError::Database(format!(
                "duplicate provider_subscription_id {}",
                subscription.provider_subscription_id
            )));
        }
        self.working.subscriptions.insert(
            subscription.provider_subscription_id.clone(),
            subscription.clone(),
        );
        Ok(())
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        match self
            .working
            .subscriptions
            .get_mut(&subscription.provider_subscription_id)
        {
            Some(row) => {
                *row = subscription.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "Subscription {} not found",
                subscription.provider_subscription_id
            ))),
        }
    }

    async fn lock_tenant(&mut self, tenant_id: Uuid) -> BillingResult<Option<Tenant>> {
        if self.working.failing_tenants.contains(&tenant_id) {
            return Err(BillingError::Database(format!(
                "could not lock tenant {} (injected)",
                tenant_id
            )));
        }
        Ok(self.working.tenants.get(&tenant_id).cloned())
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        match self.working.tenants.get_mut(&tenant.id) {
            Some(row) => {
                *row = tenant.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "Tenant {} not found",
                tenant.id
            ))),
        }
    }

    async fn delete_tenant(&mut self, tenant_id: Uuid) -> BillingResult<u64> {
        let referenced = self
            .working
            .entitlements
            .values()
            .any(|e| e.tenant_id == tenant_id)
            || self
                .working
                .subscriptions
                .values()
                .any(|s| s.tenant_id == tenant_id)
            || self
                .working
                .license_keys
                .values()
                .any(|k| k.used_tenant_id == Some(tenant_id));
        if referenced {
            return Err(BillingError::Database(format!(
                "tenant {} is still referenced by billing records",
                tenant_id
            )));
        }

        let before = self.working.tenant_admins.len();
        self.working
            .tenant_admins
            .retain(|_, admin| admin.tenant_id != tenant_id);
        let admins_deleted = (before - self.working.tenant_admins.len()) as u64;
        self.working.tenants.remove(&tenant_id);
        Ok(admins_deleted)
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let InMemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftledger_shared::TenantStatus;
    use time::macros::datetime;

    fn tenant() -> Tenant {
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut t = Tenant::pending_payment("acme", now, now);
        t.status = TenantStatus::Active;
        t
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let store = InMemoryBillingStore::new();
        let t = tenant();
        store.insert_tenant(t.clone()).await;

        {
            let mut tx = store.begin().await.unwrap();
            let mut locked = tx.lock_tenant(t.id).await.unwrap().unwrap();
            locked.suspend(datetime!(2026-01-02 00:00 UTC));
            tx.update_tenant(&locked).await.unwrap();
        }

        assert_eq!(store.tenant(t.id).await.unwrap().status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let store = InMemoryBillingStore::new();
        let t = tenant();
        store.insert_tenant(t.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_tenant(t.id).await.unwrap().unwrap();
        locked.suspend(datetime!(2026-01-02 00:00 UTC));
        tx.update_tenant(&locked).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.tenant(t.id).await.unwrap().status,
            TenantStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_webhook_gate_is_first_writer_wins() {
        let store = InMemoryBillingStore::new();
        let record = WebhookEventRecord::new(
            "stripe",
            "evt_1",
            "invoice.paid",
            serde_json::json!({}),
            datetime!(2026-01-01 00:00 UTC),
        );

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_webhook_event(&record).await.unwrap());
        assert!(!tx.insert_webhook_event(&record).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.insert_webhook_event(&record).await.unwrap());
        tx.rollback().await.unwrap();

        assert_eq!(store.webhook_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_tenant_removes_admins() {
        let store = InMemoryBillingStore::new();
        let t = tenant();
        store.insert_tenant(t.clone()).await;
        store.insert_tenant_admin(t.id).await;
        store.insert_tenant_admin(t.id).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.delete_tenant(t.id).await.unwrap(), 2);
        tx.commit().await.unwrap();

        assert!(store.tenant(t.id).await.is_none());
        assert_eq!(store.tenant_admin_count(t.id).await, 0);
    }
}
