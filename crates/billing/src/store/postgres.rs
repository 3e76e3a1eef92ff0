//! Postgres [`BillingStore`] on sqlx
//!
//! Row locks are `SELECT ... FOR UPDATE` inside the transaction; the webhook
//! gate is `INSERT ... ON CONFLICT DO NOTHING` against the
//! `(provider, event_id)` primary key.

use async_trait::async_trait;
use shiftledger_shared::{Tenant, TenantStatus};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, BillingTx};
use crate::audit::AuditLogEntry;
use crate::entitlement::{Entitlement, EntitlementSource};
use crate::error::{BillingError, BillingResult};
use crate::license_keys::{LicenseKey, LicenseKeyStatus};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::webhooks::WebhookEventRecord;

const TENANT_COLUMNS: &str =
    "id, name, status, grace_until, pending_expires_at, created_at, updated_at, deleted_at";

const LICENSE_KEY_COLUMNS: &str = "key_id, key_hash, status, batch_id, expires_at, memo, \
     used_at, used_tenant_id, revoked_at, created_at";

const ENTITLEMENT_COLUMNS: &str = "entitlement_id, tenant_id, plan_code, source, \
     subscription_id, starts_at, ends_at, revoked_at, revoked_reason, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, tenant_id, provider_customer_id, \
     provider_subscription_id, status, current_period_end, cancel_at_period_end, cancel_at, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    status: String,
    grace_until: Option<OffsetDateTime>,
    pending_expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = BillingError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        let status: TenantStatus = row
            .status
            .parse()
            .map_err(|e: shiftledger_shared::ParseTenantStatusError| {
                BillingError::Database(e.to_string())
            })?;
        Ok(Tenant {
            id: row.id,
            name: row.name,
            status,
            grace_until: row.grace_until,
            pending_expires_at: row.pending_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LicenseKeyRow {
    key_id: Uuid,
    key_hash: String,
    status: String,
    batch_id: Option<String>,
    expires_at: Option<OffsetDateTime>,
    memo: String,
    used_at: Option<OffsetDateTime>,
    used_tenant_id: Option<Uuid>,
    revoked_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<LicenseKeyRow> for LicenseKey {
    type Error = BillingError;

    fn try_from(row: LicenseKeyRow) -> Result<Self, Self::Error> {
        Ok(LicenseKey {
            key_id: row.key_id,
            key_hash: row.key_hash.trim_end().to_string(),
            status: parse_column::<LicenseKeyStatus>(&row.status)?,
            batch_id: row.batch_id,
            expires_at: row.expires_at,
            memo: row.memo,
            used_at: row.used_at,
            used_tenant_id: row.used_tenant_id,
            revoked_at: row.revoked_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntitlementRow {
    entitlement_id: Uuid,
    tenant_id: Uuid,
    plan_code: String,
    source: String,
    subscription_id: Option<Uuid>,
    starts_at: OffsetDateTime,
    ends_at: Option<OffsetDateTime>,
    revoked_at: Option<OffsetDateTime>,
    revoked_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        Ok(Entitlement {
            entitlement_id: row.entitlement_id,
            tenant_id: row.tenant_id,
            plan_code: row.plan_code,
            source: parse_column::<EntitlementSource>(&row.source)?,
            subscription_id: row.subscription_id,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            revoked_at: row.revoked_at,
            revoked_reason: row.revoked_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    provider_customer_id: String,
    provider_subscription_id: String,
    status: String,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    cancel_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            tenant_id: row.tenant_id,
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            status: parse_column::<SubscriptionStatus>(&row.status)?,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            cancel_at: row.cancel_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Enum columns are CHECK-constrained, so a parse failure means a corrupt row
fn parse_column<T>(raw: &str) -> BillingResult<T>
where
    T: std::str::FromStr<Err = BillingError>,
{
    raw.parse()
        .map_err(|e: BillingError| BillingError::Database(e.to_string()))
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBillingTx { tx }))
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_logs
                (log_id, actor_type, action, target_type, target_id, before_json, after_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.log_id)
        .bind(entry.actor_type.as_str())
        .bind(entry.action.as_str())
        .bind(entry.target_type.as_str())
        .bind(&entry.target_id)
        .bind(&entry.before_json)
        .bind(&entry.after_json)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Tenant>> {
        let sql = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Tenant::try_from)
            .transpose()
    }

    async fn list_grace_expired_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<Tenant>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tenants
            WHERE status = 'grace'
              AND grace_until < $1
              AND deleted_at IS NULL
            ORDER BY grace_until, id
            "#,
            TENANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_pending_payment_expired_tenants(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Tenant>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tenants
            WHERE status = 'pending_payment'
              AND pending_expires_at < $1
              AND deleted_at IS NULL
            ORDER BY pending_expires_at, id
            "#,
            TENANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn count_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events WHERE received_at < $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_entitlements(&self, tenant_id: Uuid) -> BillingResult<Vec<Entitlement>> {
        let sql = format!(
            "SELECT {} FROM entitlements WHERE tenant_id = $1 ORDER BY created_at, entitlement_id",
            ENTITLEMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn find_license_key(&self, key_id: Uuid) -> BillingResult<Option<LicenseKey>> {
        let sql = format!(
            "SELECT {} FROM license_keys WHERE key_id = $1",
            LICENSE_KEY_COLUMNS
        );
        sqlx::query_as::<_, LicenseKeyRow>(&sql)
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?
            .map(LicenseKey::try_from)
            .transpose()
    }

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }
}

pub struct PgBillingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingTx for PgBillingTx {
    async fn insert_webhook_event(&mut self, event: &WebhookEventRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (provider, event_id, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, event_id) DO NOTHING
            "#,
        )
        .bind(&event.provider)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn lock_license_key_by_hash(
        &mut self,
        key_hash: &str,
    ) -> BillingResult<Option<LicenseKey>> {
        let sql = format!(
            "SELECT {} FROM license_keys WHERE key_hash = $1 FOR UPDATE",
            LICENSE_KEY_COLUMNS
        );
        sqlx::query_as::<_, LicenseKeyRow>(&sql)
            .bind(key_hash)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(LicenseKey::try_from)
            .transpose()
    }

    async fn lock_license_key(&mut self, key_id: Uuid) -> BillingResult<Option<LicenseKey>> {
        let sql = format!(
            "SELECT {} FROM license_keys WHERE key_id = $1 FOR UPDATE",
            LICENSE_KEY_COLUMNS
        );
        sqlx::query_as::<_, LicenseKeyRow>(&sql)
            .bind(key_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(LicenseKey::try_from)
            .transpose()
    }

    async fn insert_license_key(&mut self, key: &LicenseKey) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO license_keys
                (key_id, key_hash, status, batch_id, expires_at, memo, used_at, used_tenant_id, revoked_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(key.key_id)
        .bind(&key.key_hash)
        .bind(key.status.as_str())
        .bind(&key.batch_id)
        .bind(key.expires_at)
        .bind(&key.memo)
        .bind(key.used_at)
        .bind(key.used_tenant_id)
        .bind(key.revoked_at)
        .bind(key.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_license_key(&mut self, key: &LicenseKey) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE license_keys
            SET status = $2, used_at = $3, used_tenant_id = $4, revoked_at = $5
            WHERE key_id = $1
            "#,
        )
        .bind(key.key_id)
        .bind(key.status.as_str())
        .bind(key.used_at)
        .bind(key.used_tenant_id)
        .bind(key.revoked_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements
                (entitlement_id, tenant_id, plan_code, source, subscription_id, starts_at,
                 ends_at, revoked_at, revoked_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entitlement.entitlement_id)
        .bind(entitlement.tenant_id)
        .bind(&entitlement.plan_code)
        .bind(entitlement.source.as_str())
        .bind(entitlement.subscription_id)
        .bind(entitlement.starts_at)
        .bind(entitlement.ends_at)
        .bind(entitlement.revoked_at)
        .bind(&entitlement.revoked_reason)
        .bind(entitlement.created_at)
        .bind(entitlement.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_entitlement(
        &mut self,
        entitlement_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        let sql = format!(
            "SELECT {} FROM entitlements WHERE entitlement_id = $1 FOR UPDATE",
            ENTITLEMENT_COLUMNS
        );
        sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(entitlement_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Entitlement::try_from)
            .transpose()
    }

    async fn update_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE entitlements
            SET plan_code = $2, ends_at = $3, revoked_at = $4, revoked_reason = $5, updated_at = $6
            WHERE entitlement_id = $1
            "#,
        )
        .bind(entitlement.entitlement_id)
        .bind(&entitlement.plan_code)
        .bind(entitlement.ends_at)
        .bind(entitlement.revoked_at)
        .bind(&entitlement.revoked_reason)
        .bind(entitlement.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_subscription_entitlements(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM entitlements
            WHERE subscription_id = $1 AND revoked_at IS NULL
            ORDER BY created_at, entitlement_id
            FOR UPDATE
            "#,
            ENTITLEMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(subscription_id)
            .fetch_all(&mut *self.tx)
            .await?;
        convert_all(rows)
    }

    async fn lock_subscription(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (subscription_id, tenant_id, provider_customer_id, provider_subscription_id, status,
                 current_period_end, cancel_at_period_end, cancel_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.tenant_id)
        .bind(&subscription.provider_customer_id)
        .bind(&subscription.provider_subscription_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancel_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, current_period_end = $3, cancel_at_period_end = $4,
                cancel_at = $5, updated_at = $6
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancel_at)
        .bind(subscription.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_tenant(&mut self, tenant_id: Uuid) -> BillingResult<Option<Tenant>> {
        let sql = format!(
            "SELECT {} FROM tenants WHERE id = $1 FOR UPDATE",
            TENANT_COLUMNS
        );
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(tenant_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Tenant::try_from)
            .transpose()
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE tenants
            SET status = $2, grace_until = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(tenant.id)
        .bind(tenant.status.as_str())
        .bind(tenant.grace_until)
        .bind(tenant.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_tenant(&mut self, tenant_id: Uuid) -> BillingResult<u64> {
        let admins = sqlx::query("DELETE FROM tenant_admins WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(admins.rows_affected())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use time::macros::datetime;
    use time::Duration;
    use tokio::sync::Barrier;

    use super::*;
    use crate::config::BillingConfig;
    use crate::license_keys::{hash_key, normalize_key, LicenseKeyService};

    const NOW: OffsetDateTime = datetime!(2026-03-10 12:00 UTC);

    async fn seed_pending_tenant(pool: &PgPool, name: &str) -> Uuid {
        let tenant = Tenant::pending_payment(name, NOW + Duration::days(7), NOW);
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, status, pending_expires_at, created_at, updated_at)
            VALUES ($1, $2, 'pending_payment', $3, $4, $4)
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.pending_expires_at)
        .bind(tenant.created_at)
        .execute(pool)
        .await
        .unwrap();
        tenant.id
    }

    // Each claim runs on its own connection; only the row lock keeps two
    // READ COMMITTED transactions from both seeing the key as unused.
    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres server"]
    async fn test_concurrent_claims_serialize_on_key_row(pool: PgPool) {
        let store = Arc::new(PgBillingStore::new(pool.clone()));
        let key = LicenseKey::new(
            hash_key(&normalize_key("1234-5678-9ABC-DEF0").unwrap()),
            None,
            None,
            "race",
            NOW - Duration::days(1),
        )
        .unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert_license_key(&key).await.unwrap();
        tx.commit().await.unwrap();

        let mut tenants = Vec::new();
        for i in 0..4 {
            tenants.push(seed_pending_tenant(&pool, &format!("tenant-{}", i)).await);
        }

        let service = Arc::new(LicenseKeyService::new(store.clone(), &BillingConfig::default()));
        let barrier = Arc::new(Barrier::new(tenants.len()));
        let mut handles = Vec::new();
        for tenant_id in tenants.clone() {
            let service = service.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.claim("1234-5678-9abc-def0", tenant_id, NOW).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(BillingError::LicenseKeyAlreadyClaimed) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);

        let stored = store.find_license_key(key.key_id).await.unwrap().unwrap();
        assert_eq!(stored.status, LicenseKeyStatus::Used);
        let booth_grants: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entitlements WHERE source = 'booth' AND tenant_id = ANY($1)",
        )
        .bind(&tenants)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(booth_grants, 1);
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres server"]
    async fn test_webhook_gate_conflict_reports_duplicate(pool: PgPool) {
        let store = PgBillingStore::new(pool);
        let record =
            WebhookEventRecord::new("stripe", "evt_123", "invoice.paid", serde_json::json!({}), NOW);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_webhook_event(&record).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.insert_webhook_event(&record).await.unwrap());
        tx.rollback().await.unwrap();
    }
}
