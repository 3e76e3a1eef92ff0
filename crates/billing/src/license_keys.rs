//! License keys: pre-minted one-time credentials for a lifetime entitlement
//!
//! Keys are handed out as `XXXX-XXXX-XXXX-XXXX` (16 hex characters). Only the
//! SHA-256 of the normalized key is ever stored, so a leaked table cannot be
//! redeemed.
//!
//! ## Claim protocol
//!
//! Claiming runs in a single transaction: the key row is read with an
//! exclusive row lock, checked, flipped to `used`, and the lifetime
//! entitlement is inserted before commit. Two concurrent claims of the same
//! key serialise on the lock; the second one sees `used` and fails with
//! [`BillingError::LicenseKeyAlreadyClaimed`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditLog, AuditLogEntry, TargetType};
use crate::config::BillingConfig;
use crate::entitlement::{Entitlement, EntitlementSource};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Hex characters in a normalized key
pub const KEY_HEX_LEN: usize = 16;
/// Characters per dash-separated group in the presented form
pub const KEY_GROUP_LEN: usize = 4;
/// Hex characters in a stored key hash
pub const KEY_HASH_LEN: usize = 64;
/// Upper bound for a single issuance batch
pub const MAX_BATCH_SIZE: usize = 1000;

/// Strip dashes and whitespace, uppercase, and check the result is 16 hex chars
pub fn normalize_key(input: &str) -> BillingResult<String> {
    let normalized: String = input
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();

    if normalized.len() != KEY_HEX_LEN || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BillingError::InvalidInput(
            "license key must look like XXXX-XXXX-XXXX-XXXX (hex)".to_string(),
        ));
    }
    Ok(normalized)
}

/// SHA-256 of a normalized key, as 64 lowercase hex characters
pub fn hash_key(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Render a normalized key in its grouped form
pub fn format_key(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(KEY_GROUP_LEN)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Fresh random key material, already normalized
pub fn generate_key() -> String {
    hex::encode_upper(rand::random::<[u8; KEY_HEX_LEN / 2]>())
}

pub fn validate_key_hash(key_hash: &str) -> BillingResult<()> {
    if key_hash.len() != KEY_HASH_LEN || !key_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BillingError::InvalidInput(format!(
            "license key hash must be {} hex characters",
            KEY_HASH_LEN
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseKeyStatus {
    Unused,
    Used,
    Revoked,
}

impl LicenseKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseKeyStatus::Unused => "unused",
            LicenseKeyStatus::Used => "used",
            LicenseKeyStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for LicenseKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LicenseKeyStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unused" => Ok(LicenseKeyStatus::Unused),
            "used" => Ok(LicenseKeyStatus::Used),
            "revoked" => Ok(LicenseKeyStatus::Revoked),
            other => Err(BillingError::InvalidInput(format!(
                "unknown license key status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseKey {
    pub key_id: Uuid,
    pub key_hash: String,
    pub status: LicenseKeyStatus,
    pub batch_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub memo: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
    pub used_tenant_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LicenseKey {
    pub fn new(
        key_hash: impl Into<String>,
        batch_id: Option<String>,
        expires_at: Option<OffsetDateTime>,
        memo: impl Into<String>,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        let key_hash = key_hash.into().to_ascii_lowercase();
        validate_key_hash(&key_hash)?;
        Ok(Self {
            key_id: Uuid::now_v7(),
            key_hash,
            status: LicenseKeyStatus::Unused,
            batch_id,
            expires_at,
            memo: memo.into(),
            used_at: None,
            used_tenant_id: None,
            revoked_at: None,
            created_at: now,
        })
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// `unused -> used`; leaves the key untouched on error
    pub fn mark_as_used(&mut self, tenant_id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        if self.is_expired(now) {
            return Err(BillingError::LicenseKeyExpired);
        }
        match self.status {
            LicenseKeyStatus::Unused => {}
            LicenseKeyStatus::Used => return Err(BillingError::LicenseKeyAlreadyClaimed),
            LicenseKeyStatus::Revoked => return Err(BillingError::LicenseKeyRevoked),
        }
        self.status = LicenseKeyStatus::Used;
        self.used_at = Some(now);
        self.used_tenant_id = Some(tenant_id);
        Ok(())
    }

    /// `unused -> revoked` or `used -> revoked`; a second revoke fails
    pub fn revoke(&mut self, now: OffsetDateTime) -> BillingResult<()> {
        if self.status == LicenseKeyStatus::Revoked {
            return Err(BillingError::LicenseKeyRevoked);
        }
        self.status = LicenseKeyStatus::Revoked;
        self.revoked_at = Some(now);
        Ok(())
    }
}

/// Parameters for minting a batch of keys
#[derive(Debug, Clone, Default)]
pub struct IssueKeysRequest {
    pub count: usize,
    pub batch_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub memo: String,
}

/// A freshly minted key. `key` is the only copy of the plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub key_id: Uuid,
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedBatch {
    pub batch_id: Option<String>,
    pub keys: Vec<IssuedKey>,
}

pub struct LicenseKeyService {
    store: Arc<dyn BillingStore>,
    audit: AuditLog,
    lifetime_plan_code: String,
}

impl LicenseKeyService {
    pub fn new(store: Arc<dyn BillingStore>, config: &BillingConfig) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            store,
            audit,
            lifetime_plan_code: config.lifetime_plan_code.clone(),
        }
    }

    /// Redeem `key_material` for `tenant_id`, returning the lifetime entitlement
    pub async fn claim(
        &self,
        key_material: &str,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let key_hash = hash_key(&normalize_key(key_material)?);

        let mut tx = self.store.begin().await?;

        let mut key = tx
            .lock_license_key_by_hash(&key_hash)
            .await?
            .ok_or_else(|| BillingError::NotFound("License key not found".to_string()))?;

        let mut tenant = tx
            .lock_tenant(tenant_id)
            .await?
            .filter(|t| !t.is_deleted())
            .ok_or_else(|| BillingError::NotFound(format!("Tenant {} not found", tenant_id)))?;

        let key_before = key.clone();
        if let Err(e) = key.mark_as_used(tenant_id, now) {
            tracing::info!(
                key_id = %key.key_id,
                tenant_id = %tenant_id,
                status = %key.status,
                reason = %e,
                "License key claim rejected"
            );
            return Err(e);
        }
        tx.update_license_key(&key).await?;

        let entitlement = Entitlement::lifetime(
            tenant_id,
            &self.lifetime_plan_code,
            EntitlementSource::Booth,
            now,
        );
        tx.insert_entitlement(&entitlement).await?;

        let tenant_before = tenant.clone();
        let tenant_activated = tenant.activate(now);
        if tenant_activated {
            tx.update_tenant(&tenant).await?;
        }

        tx.commit().await?;

        tracing::info!(
            key_id = %key.key_id,
            tenant_id = %tenant_id,
            entitlement_id = %entitlement.entitlement_id,
            tenant_activated = tenant_activated,
            "License key claimed"
        );

        let mut entries = vec![
            AuditLogEntry::builder(AuditAction::LicenseKeyClaimed, TargetType::LicenseKey, key.key_id)
                .actor(ActorType::Tenant)
                .before(&key_before)
                .after(&key)
                .build(now),
            AuditLogEntry::builder(
                AuditAction::EntitlementGranted,
                TargetType::Entitlement,
                entitlement.entitlement_id,
            )
            .actor(ActorType::Tenant)
            .after(&entitlement)
            .build(now),
        ];
        if tenant_activated {
            entries.push(
                AuditLogEntry::builder(AuditAction::TenantActivated, TargetType::Tenant, tenant_id)
                    .actor(ActorType::Tenant)
                    .before(&tenant_before)
                    .after(&tenant)
                    .build(now),
            );
        }
        self.audit.record_all(entries).await;

        Ok(entitlement)
    }

    /// Mint `count` keys and store their hashes
    pub async fn issue_batch(
        &self,
        request: IssueKeysRequest,
        now: OffsetDateTime,
    ) -> BillingResult<IssuedBatch> {
        if request.count == 0 || request.count > MAX_BATCH_SIZE {
            return Err(BillingError::InvalidInput(format!(
                "count must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if request.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(BillingError::InvalidInput(
                "expires_at must be in the future".to_string(),
            ));
        }

        let mut issued = Vec::with_capacity(request.count);
        let mut tx = self.store.begin().await?;
        for _ in 0..request.count {
            let material = generate_key();
            let key = LicenseKey::new(
                hash_key(&material),
                request.batch_id.clone(),
                request.expires_at,
                request.memo.clone(),
                now,
            )?;
            tx.insert_license_key(&key).await?;
            issued.push(IssuedKey {
                key_id: key.key_id,
                key: format_key(&material),
            });
        }
        tx.commit().await?;

        tracing::info!(
            count = issued.len(),
            batch_id = ?request.batch_id,
            "License keys issued"
        );

        self.audit
            .record(
                AuditLogEntry::builder(
                    AuditAction::LicenseKeysIssued,
                    TargetType::LicenseKeyBatch,
                    request.batch_id.as_deref().unwrap_or("-"),
                )
                .actor(ActorType::Operator)
                .data(serde_json::json!({
                    "count": issued.len(),
                    "key_ids": issued.iter().map(|k| k.key_id).collect::<Vec<_>>(),
                    "expires_at": request.expires_at.map(|t| t.unix_timestamp()),
                    "memo": request.memo,
                }))
                .build(now),
            )
            .await;

        Ok(IssuedBatch {
            batch_id: request.batch_id,
            keys: issued,
        })
    }

    /// Revoke a key. Any entitlement it produced stays in place.
    pub async fn revoke(
        &self,
        key_id: Uuid,
        actor: ActorType,
        now: OffsetDateTime,
    ) -> BillingResult<LicenseKey> {
        let mut tx = self.store.begin().await?;
        let mut key = tx
            .lock_license_key(key_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("License key {} not found", key_id)))?;

        let before = key.clone();
        key.revoke(now)?;
        tx.update_license_key(&key).await?;
        tx.commit().await?;

        tracing::info!(
            key_id = %key_id,
            previous_status = %before.status,
            "License key revoked"
        );

        self.audit
            .record(
                AuditLogEntry::builder(AuditAction::LicenseKeyRevoked, TargetType::LicenseKey, key_id)
                    .actor(actor)
                    .before(&before)
                    .after(&key)
                    .build(now),
            )
            .await;

        Ok(key)
    }

    pub async fn get(&self, key_id: Uuid) -> BillingResult<Option<LicenseKey>> {
        self.store.find_license_key(key_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn unused_key(now: OffsetDateTime) -> LicenseKey {
        LicenseKey::new(hash_key("0123456789ABCDEF"), None, None, "", now).unwrap()
    }

    #[test]
    fn test_normalize_strips_dashes_and_uppercases() {
        assert_eq!(
            normalize_key(" abcd-ef01-2345-6789 ").unwrap(),
            "ABCDEF0123456789"
        );
        assert_eq!(normalize_key("ABCDEF0123456789").unwrap(), "ABCDEF0123456789");
    }

    #[test]
    fn test_normalize_rejects_bad_material() {
        assert!(normalize_key("ABCD-EF01-2345").is_err());
        assert!(normalize_key("ABCD-EF01-2345-678G").is_err());
        assert!(normalize_key("ABCD-EF01-2345-67890").is_err());
        assert!(normalize_key("").is_err());
    }

    #[test]
    fn test_hash_is_sha256_of_normalized_form() {
        let a = hash_key(&normalize_key("abcd-ef01-2345-6789").unwrap());
        let b = hash_key(&normalize_key("ABCDEF0123456789").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_HASH_LEN);
        assert_eq!(
            hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_generated_keys_format() {
        let material = generate_key();
        assert_eq!(material.len(), KEY_HEX_LEN);
        let formatted = format_key(&material);
        assert_eq!(formatted.len(), 19);
        assert_eq!(formatted.matches('-').count(), 3);
        assert_eq!(normalize_key(&formatted).unwrap(), material);
    }

    #[test]
    fn test_new_rejects_short_hash() {
        let err = LicenseKey::new("abc123", None, None, "", datetime!(2026-01-01 00:00 UTC))
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[test]
    fn test_mark_as_used_records_claimant() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let tenant = Uuid::now_v7();
        let mut key = unused_key(now);
        key.mark_as_used(tenant, now).unwrap();
        assert_eq!(key.status, LicenseKeyStatus::Used);
        assert_eq!(key.used_tenant_id, Some(tenant));
        assert_eq!(key.used_at, Some(now));
    }

    #[test]
    fn test_used_key_cannot_be_claimed_again() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut key = unused_key(now);
        key.mark_as_used(Uuid::now_v7(), now).unwrap();
        let before = key.clone();

        let err = key.mark_as_used(Uuid::now_v7(), now).unwrap_err();
        assert!(matches!(err, BillingError::LicenseKeyAlreadyClaimed));
        assert_eq!(key, before);
    }

    #[test]
    fn test_expired_key_cannot_be_claimed() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut key = unused_key(now);
        key.expires_at = Some(now - Duration::seconds(1));
        let err = key.mark_as_used(Uuid::now_v7(), now).unwrap_err();
        assert!(matches!(err, BillingError::LicenseKeyExpired));
        assert_eq!(key.status, LicenseKeyStatus::Unused);
    }

    #[test]
    fn test_revoke_paths() {
        let now = datetime!(2026-01-01 00:00 UTC);

        let mut unused = unused_key(now);
        unused.revoke(now).unwrap();
        assert_eq!(unused.status, LicenseKeyStatus::Revoked);

        let mut used = unused_key(now);
        used.mark_as_used(Uuid::now_v7(), now).unwrap();
        used.revoke(now).unwrap();
        assert_eq!(used.status, LicenseKeyStatus::Revoked);
        assert!(used.used_tenant_id.is_some(), "claim history is kept");

        let before = used.clone();
        assert!(matches!(used.revoke(now), Err(BillingError::LicenseKeyRevoked)));
        assert_eq!(used, before);
    }

    #[test]
    fn test_revoked_key_cannot_be_claimed() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut key = unused_key(now);
        key.revoke(now).unwrap();
        assert!(matches!(
            key.mark_as_used(Uuid::now_v7(), now),
            Err(BillingError::LicenseKeyRevoked)
        ));
    }
}
