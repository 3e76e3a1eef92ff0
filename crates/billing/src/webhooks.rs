//! Payment provider webhook handling
//!
//! Events are delivered at least once and in no particular order. Each event
//! is claimed through the `webhook_events` idempotency gate in the same
//! transaction as the mutations it causes:
//!
//! 1. Parse the envelope and translate it to a [`WebhookAction`] (no I/O).
//! 2. Begin, insert `(provider, event_id)`; a conflict means the event was
//!    already applied and the handler returns [`WebhookOutcome::Duplicate`].
//! 3. Apply the action, commit, then write audit entries.
//!
//! If step 3 fails the gate row is rolled back with everything else, so the
//! provider's redelivery gets another attempt.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditLog, AuditLogEntry, TargetType};
use crate::config::{days_duration, BillingConfig, STRIPE_PROVIDER};
use crate::entitlement::{Entitlement, EntitlementSource};
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, BillingTx};
use crate::subscriptions::{Subscription, SubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Revocation reason stamped on entitlements when their subscription ends
pub const SUBSCRIPTION_CANCELED_REASON: &str = "subscription_canceled";

/// Row recorded by the idempotency gate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEventRecord {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl WebhookEventRecord {
    pub fn new(
        provider: impl Into<String>,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            provider: provider.into(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            received_at,
        }
    }
}

/// `{id, type, created, data: {object}}`
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: String,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    cancel_at: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    items: Option<ObjectList<SubscriptionItemObject>>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemObject {
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    parent: Option<InvoiceParent>,
    #[serde(default)]
    lines: Option<ObjectList<InvoiceLineObject>>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSubscriptionDetails {
    #[serde(default)]
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLineObject {
    #[serde(default)]
    period: Option<PeriodObject>,
}

#[derive(Debug, Deserialize)]
struct PeriodObject {
    #[serde(default)]
    end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Provider subscription state carried by a subscription event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub tenant_id: Option<Uuid>,
    pub plan_code: Option<String>,
}

/// What an event asks the engine to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    SyncSubscription(SubscriptionSnapshot),
    CancelSubscription {
        provider_subscription_id: String,
    },
    RecordPayment {
        provider_subscription_id: String,
        period_end: Option<OffsetDateTime>,
    },
    RecordPaymentFailure {
        provider_subscription_id: String,
    },
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// State was changed
    Applied,
    /// The event had already been applied
    Duplicate,
    /// Recorded, but nothing to do
    Ignored,
}

fn invalid(msg: impl Into<String>) -> BillingError {
    BillingError::WebhookPayloadInvalid(msg.into())
}

fn unix_time(field: &str, secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| invalid(format!("{} is out of range: {}", field, e)))
}

fn unix_time_opt(field: &str, secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(|s| unix_time(field, s)).transpose()
}

/// Parse a raw event body
pub fn parse_envelope(payload: &str) -> BillingResult<(WebhookEnvelope, serde_json::Value)> {
    let raw: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| invalid(format!("not JSON: {}", e)))?;
    let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| invalid(format!("bad event envelope: {}", e)))?;
    if envelope.id.trim().is_empty() {
        return Err(invalid("event id is empty"));
    }
    Ok((envelope, raw))
}

fn parse_subscription(object: &serde_json::Value) -> BillingResult<SubscriptionSnapshot> {
    let sub: SubscriptionObject = serde_json::from_value(object.clone())
        .map_err(|e| invalid(format!("bad subscription object: {}", e)))?;

    // Newer API versions report the period on the subscription items
    let period_end = sub.current_period_end.or_else(|| {
        sub.items
            .as_ref()
            .and_then(|items| items.data.iter().filter_map(|i| i.current_period_end).max())
    });

    let tenant_id = sub
        .metadata
        .get("tenant_id")
        .map(|raw| {
            Uuid::parse_str(raw).map_err(|_| invalid(format!("metadata tenant_id '{}' is not a UUID", raw)))
        })
        .transpose()?;

    Ok(SubscriptionSnapshot {
        provider_subscription_id: sub.id,
        provider_customer_id: sub.customer,
        status: SubscriptionStatus::from_provider(&sub.status)?,
        current_period_end: unix_time_opt("current_period_end", period_end)?,
        cancel_at_period_end: sub.cancel_at_period_end,
        cancel_at: unix_time_opt("cancel_at", sub.cancel_at)?,
        tenant_id,
        plan_code: sub.metadata.get("plan_code").cloned(),
    })
}

fn parse_invoice(object: &serde_json::Value) -> BillingResult<(Option<String>, Option<OffsetDateTime>)> {
    let invoice: InvoiceObject = serde_json::from_value(object.clone())
        .map_err(|e| invalid(format!("bad invoice object: {}", e)))?;

    let subscription = invoice.subscription.or_else(|| {
        invoice
            .parent
            .and_then(|p| p.subscription_details)
            .and_then(|d| d.subscription)
    });
    let period_end = invoice
        .lines
        .and_then(|lines| lines.data.into_iter().filter_map(|l| l.period?.end).max());

    Ok((subscription, unix_time_opt("lines.period.end", period_end)?))
}

/// Map an event onto the action it requests. Pure; rejects malformed objects.
pub fn translate_event(envelope: &WebhookEnvelope) -> BillingResult<WebhookAction> {
    let object = &envelope.data.object;
    match envelope.event_type.as_str() {
        "customer.subscription.created" | "customer.subscription.updated" => {
            Ok(WebhookAction::SyncSubscription(parse_subscription(object)?))
        }
        "customer.subscription.deleted" => {
            let snapshot = parse_subscription(object)?;
            Ok(WebhookAction::CancelSubscription {
                provider_subscription_id: snapshot.provider_subscription_id,
            })
        }
        "invoice.paid" => match parse_invoice(object)? {
            (Some(provider_subscription_id), period_end) => Ok(WebhookAction::RecordPayment {
                provider_subscription_id,
                period_end,
            }),
            // One-off invoice
            (None, _) => Ok(WebhookAction::Ignore),
        },
        "invoice.payment_failed" => match parse_invoice(object)? {
            (Some(provider_subscription_id), _) => Ok(WebhookAction::RecordPaymentFailure {
                provider_subscription_id,
            }),
            (None, _) => Ok(WebhookAction::Ignore),
        },
        _ => Ok(WebhookAction::Ignore),
    }
}

/// Hex HMAC-SHA256 of `"<timestamp>.<payload>"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Webhook handler for provider events
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    audit: AuditLog,
    config: BillingConfig,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            store,
            audit,
            config,
        }
    }

    /// Check a `t=<unix>,v1=<hex>` signature header
    ///
    /// Several `v1` entries may be present while the secret is being rolled;
    /// any match is accepted.
    pub fn verify_signature(
        &self,
        payload: &str,
        header: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("WEBHOOK_SECRET is not set".to_string()))?;

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in webhook signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let age = now
            .unix_timestamp()
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
            .ok_or_else(|| {
                tracing::warn!(timestamp = timestamp, "Webhook timestamp out of range");
                BillingError::WebhookSignatureInvalid
            })?;
        if age > self.config.webhook_tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now.unix_timestamp(),
                age_secs = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(secret, timestamp, payload)?;
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }

    /// Verify the signature, then handle the event as coming from the default provider
    pub async fn handle_signed_event(
        &self,
        payload: &str,
        signature_header: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        self.verify_signature(payload, signature_header, now)?;
        self.handle_event(STRIPE_PROVIDER, payload, now).await
    }

    /// Handle a verified event body
    pub async fn handle_event(
        &self,
        provider: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let (envelope, raw) = parse_envelope(payload)?;
        let action = translate_event(&envelope)?;

        let record = WebhookEventRecord::new(provider, &envelope.id, &envelope.event_type, raw, now);

        let mut tx = self.store.begin().await?;
        if !tx.insert_webhook_event(&record).await? {
            tx.rollback().await?;
            tracing::info!(
                provider = %provider,
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let mut entries = Vec::new();
        let outcome = match self.apply(tx.as_mut(), action, now, &mut entries).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Dropping the transaction releases the gate row too
                if let BillingError::InvalidTransition { from, to } = &e {
                    tracing::warn!(
                        provider = %provider,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        from = %from,
                        to = %to,
                        "Webhook event permanently rejected: every redelivery will fail the same transition"
                    );
                } else {
                    tracing::warn!(
                        provider = %provider,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        error = %e,
                        "Webhook event rejected"
                    );
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        tracing::info!(
            provider = %provider,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            outcome = ?outcome,
            "Webhook event processed"
        );

        self.audit.record_all(entries).await;
        Ok(outcome)
    }

    async fn apply(
        &self,
        tx: &mut dyn BillingTx,
        action: WebhookAction,
        now: OffsetDateTime,
        entries: &mut Vec<AuditLogEntry>,
    ) -> BillingResult<WebhookOutcome> {
        match action {
            WebhookAction::Ignore => Ok(WebhookOutcome::Ignored),
            WebhookAction::SyncSubscription(snapshot) => {
                self.sync_subscription(tx, snapshot, now, entries).await
            }
            WebhookAction::CancelSubscription {
                provider_subscription_id,
            } => {
                if tx.lock_subscription(&provider_subscription_id).await?.is_none() {
                    tracing::info!(
                        provider_subscription_id = %provider_subscription_id,
                        "Deleted subscription is not mirrored, nothing to cancel"
                    );
                    return Ok(WebhookOutcome::Ignored);
                }
                self.transition(
                    tx,
                    &provider_subscription_id,
                    SubscriptionStatus::Canceled,
                    None,
                    now,
                    entries,
                )
                .await
            }
            WebhookAction::RecordPayment {
                provider_subscription_id,
                period_end,
            } => {
                self.transition(
                    tx,
                    &provider_subscription_id,
                    SubscriptionStatus::Active,
                    period_end,
                    now,
                    entries,
                )
                .await
            }
            WebhookAction::RecordPaymentFailure {
                provider_subscription_id,
            } => {
                let current = tx
                    .lock_subscription(&provider_subscription_id)
                    .await?
                    .ok_or_else(|| unknown_subscription(&provider_subscription_id))?;
                if current.status == SubscriptionStatus::Incomplete {
                    tracing::info!(
                        provider_subscription_id = %provider_subscription_id,
                        "Payment failure on incomplete subscription, no change"
                    );
                    return Ok(WebhookOutcome::Ignored);
                }
                self.transition(
                    tx,
                    &provider_subscription_id,
                    SubscriptionStatus::PastDue,
                    None,
                    now,
                    entries,
                )
                .await
            }
        }
    }

    async fn sync_subscription(
        &self,
        tx: &mut dyn BillingTx,
        snapshot: SubscriptionSnapshot,
        now: OffsetDateTime,
        entries: &mut Vec<AuditLogEntry>,
    ) -> BillingResult<WebhookOutcome> {
        let subscription = match tx.lock_subscription(&snapshot.provider_subscription_id).await? {
            Some(mut sub) => {
                let before = sub.clone();
                sub.update_status(now, snapshot.status, snapshot.current_period_end)?;
                sub.schedule_cancellation(now, snapshot.cancel_at_period_end, snapshot.cancel_at);
                tx.update_subscription(&sub).await?;
                if subscription_changed(&before, &sub) {
                    entries.push(
                        AuditLogEntry::builder(
                            AuditAction::SubscriptionUpdated,
                            TargetType::Subscription,
                            sub.subscription_id,
                        )
                        .actor(ActorType::Provider)
                        .before(&before)
                        .after(&sub)
                        .build(now),
                    );
                }
                sub
            }
            None => {
                let tenant_id = snapshot.tenant_id.ok_or_else(|| {
                    invalid(format!(
                        "subscription {} has no tenant_id metadata",
                        snapshot.provider_subscription_id
                    ))
                })?;
                // The tenant row must exist before the subscription references it
                lock_live_tenant(tx, tenant_id).await?;

                let mut sub = Subscription::new(
                    tenant_id,
                    &snapshot.provider_customer_id,
                    &snapshot.provider_subscription_id,
                    snapshot.status,
                    snapshot.current_period_end,
                    now,
                );
                sub.schedule_cancellation(now, snapshot.cancel_at_period_end, snapshot.cancel_at);
                tx.insert_subscription(&sub).await?;
                entries.push(
                    AuditLogEntry::builder(
                        AuditAction::SubscriptionCreated,
                        TargetType::Subscription,
                        sub.subscription_id,
                    )
                    .actor(ActorType::Provider)
                    .after(&sub)
                    .build(now),
                );
                sub
            }
        };

        self.apply_access(tx, &subscription, snapshot.plan_code.as_deref(), now, entries)
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn transition(
        &self,
        tx: &mut dyn BillingTx,
        provider_subscription_id: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
        entries: &mut Vec<AuditLogEntry>,
    ) -> BillingResult<WebhookOutcome> {
        let mut sub = tx
            .lock_subscription(provider_subscription_id)
            .await?
            .ok_or_else(|| unknown_subscription(provider_subscription_id))?;

        let before = sub.clone();
        sub.update_status(now, status, period_end)?;
        tx.update_subscription(&sub).await?;
        if subscription_changed(&before, &sub) {
            tracing::info!(
                tenant_id = %sub.tenant_id,
                provider_subscription_id = %provider_subscription_id,
                from = %before.status,
                to = %sub.status,
                "Subscription status updated"
            );
            entries.push(
                AuditLogEntry::builder(
                    AuditAction::SubscriptionUpdated,
                    TargetType::Subscription,
                    sub.subscription_id,
                )
                .actor(ActorType::Provider)
                .before(&before)
                .after(&sub)
                .build(now),
            );
        }

        self.apply_access(tx, &sub, None, now, entries).await?;
        Ok(WebhookOutcome::Applied)
    }

    /// Bring entitlements and tenant status in line with the subscription status
    async fn apply_access(
        &self,
        tx: &mut dyn BillingTx,
        sub: &Subscription,
        plan_code: Option<&str>,
        now: OffsetDateTime,
        entries: &mut Vec<AuditLogEntry>,
    ) -> BillingResult<()> {
        let mut tenant = lock_live_tenant(tx, sub.tenant_id).await?;
        let tenant_before = tenant.clone();

        match sub.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                self.ensure_entitlement(tx, sub, plan_code, now, entries)
                    .await?;
                if tenant.activate(now) {
                    tx.update_tenant(&tenant).await?;
                    tracing::info!(tenant_id = %tenant.id, "Tenant activated by subscription");
                    entries.push(
                        AuditLogEntry::builder(AuditAction::TenantActivated, TargetType::Tenant, tenant.id)
                            .actor(ActorType::Provider)
                            .before(&tenant_before)
                            .after(&tenant)
                            .build(now),
                    );
                }
            }
            SubscriptionStatus::PastDue => {
                let grace_until = days_duration(self.config.grace_period_days)
                    .and_then(|grace| now.checked_add(grace))
                    .ok_or_else(|| {
                        BillingError::Config(format!(
                            "grace period of {} days is out of range",
                            self.config.grace_period_days
                        ))
                    })?;
                if tenant.enter_grace(now, grace_until) {
                    tx.update_tenant(&tenant).await?;
                    tracing::info!(
                        tenant_id = %tenant.id,
                        grace_until = %grace_until,
                        "Tenant entered grace period"
                    );
                    entries.push(
                        AuditLogEntry::builder(
                            AuditAction::TenantGraceStarted,
                            TargetType::Tenant,
                            tenant.id,
                        )
                        .actor(ActorType::Provider)
                        .before(&tenant_before)
                        .after(&tenant)
                        .build(now),
                    );
                }
            }
            SubscriptionStatus::Canceled => {
                for mut entitlement in tx
                    .lock_subscription_entitlements(sub.subscription_id)
                    .await?
                {
                    let before = entitlement.clone();
                    entitlement.revoke(now, SUBSCRIPTION_CANCELED_REASON)?;
                    tx.update_entitlement(&entitlement).await?;
                    tracing::info!(
                        tenant_id = %sub.tenant_id,
                        entitlement_id = %entitlement.entitlement_id,
                        "Entitlement revoked by subscription cancellation"
                    );
                    entries.push(
                        AuditLogEntry::builder(
                            AuditAction::EntitlementRevoked,
                            TargetType::Entitlement,
                            entitlement.entitlement_id,
                        )
                        .actor(ActorType::Provider)
                        .before(&before)
                        .after(&entitlement)
                        .build(now),
                    );
                }
            }
            // Unpaid tenants stay in grace until the expiry job suspends them
            SubscriptionStatus::Unpaid | SubscriptionStatus::Incomplete => {}
        }
        Ok(())
    }

    /// One current entitlement per subscription, ending with its billing period
    async fn ensure_entitlement(
        &self,
        tx: &mut dyn BillingTx,
        sub: &Subscription,
        plan_code: Option<&str>,
        now: OffsetDateTime,
        entries: &mut Vec<AuditLogEntry>,
    ) -> BillingResult<()> {
        let period_end = sub.current_period_end.ok_or_else(|| {
            invalid(format!(
                "subscription {} has no current period end",
                sub.provider_subscription_id
            ))
        })?;

        let current = tx
            .lock_subscription_entitlements(sub.subscription_id)
            .await?;

        match current.into_iter().last() {
            Some(mut entitlement) => {
                if entitlement.ends_at == Some(period_end) {
                    return Ok(());
                }
                let before = entitlement.clone();
                entitlement.extend_ends_at(now, period_end);
                tx.update_entitlement(&entitlement).await?;
                entries.push(
                    AuditLogEntry::builder(
                        AuditAction::EntitlementExtended,
                        TargetType::Entitlement,
                        entitlement.entitlement_id,
                    )
                    .actor(ActorType::Provider)
                    .before(&before)
                    .after(&entitlement)
                    .build(now),
                );
            }
            None => {
                let plan_code = plan_code.unwrap_or(&self.config.default_plan_code);
                let entitlement = Entitlement::new(
                    sub.tenant_id,
                    plan_code,
                    EntitlementSource::Stripe,
                    now,
                    Some(period_end),
                    now,
                )
                .for_subscription(sub.subscription_id);
                tx.insert_entitlement(&entitlement).await?;
                entries.push(
                    AuditLogEntry::builder(
                        AuditAction::EntitlementGranted,
                        TargetType::Entitlement,
                        entitlement.entitlement_id,
                    )
                    .actor(ActorType::Provider)
                    .after(&entitlement)
                    .build(now),
                );
            }
        }
        Ok(())
    }
}

async fn lock_live_tenant(
    tx: &mut dyn BillingTx,
    tenant_id: Uuid,
) -> BillingResult<shiftledger_shared::Tenant> {
    tx.lock_tenant(tenant_id)
        .await?
        .filter(|t| !t.is_deleted())
        .ok_or_else(|| BillingError::NotFound(format!("Tenant {} not found", tenant_id)))
}

fn unknown_subscription(provider_subscription_id: &str) -> BillingError {
    BillingError::NotFound(format!("Subscription {} not found", provider_subscription_id))
}

fn subscription_changed(before: &Subscription, after: &Subscription) -> bool {
    before.status != after.status
        || before.current_period_end != after.current_period_end
        || before.cancel_at_period_end != after.cancel_at_period_end
        || before.cancel_at != after.cancel_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;
    use serde_json::json;
    use time::macros::datetime;

    fn envelope(event_type: &str, object: serde_json::Value) -> WebhookEnvelope {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1767225600,
            "data": { "object": object }
        }))
        .unwrap()
    }

    fn handler_with_secret(secret: &str) -> WebhookHandler {
        let config = BillingConfig {
            webhook_secret: Some(secret.to_string()),
            ..BillingConfig::default()
        };
        WebhookHandler::new(Arc::new(InMemoryBillingStore::new()), config)
    }

    #[test]
    fn test_subscription_event_translates_to_sync() {
        let tenant_id = Uuid::now_v7();
        let action = translate_event(&envelope(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "past_due",
                "current_period_end": 1769904000,
                "metadata": { "tenant_id": tenant_id.to_string(), "plan_code": "pro" }
            }),
        ))
        .unwrap();

        match action {
            WebhookAction::SyncSubscription(snapshot) => {
                assert_eq!(snapshot.provider_subscription_id, "sub_1");
                assert_eq!(snapshot.status, SubscriptionStatus::PastDue);
                assert_eq!(
                    snapshot.current_period_end,
                    Some(datetime!(2026-02-01 00:00 UTC))
                );
                assert_eq!(snapshot.tenant_id, Some(tenant_id));
                assert_eq!(snapshot.plan_code.as_deref(), Some("pro"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_period_end_falls_back_to_items() {
        let action = translate_event(&envelope(
            "customer.subscription.created",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "items": { "data": [ { "current_period_end": 1769904000 } ] }
            }),
        ))
        .unwrap();
        let WebhookAction::SyncSubscription(snapshot) = action else {
            panic!("expected sync");
        };
        assert_eq!(
            snapshot.current_period_end,
            Some(datetime!(2026-02-01 00:00 UTC))
        );
    }

    #[test]
    fn test_invoice_paid_uses_line_period() {
        let action = translate_event(&envelope(
            "invoice.paid",
            json!({
                "subscription": "sub_1",
                "lines": { "data": [ { "period": { "start": 1767225600, "end": 1769904000 } } ] }
            }),
        ))
        .unwrap();
        assert_eq!(
            action,
            WebhookAction::RecordPayment {
                provider_subscription_id: "sub_1".to_string(),
                period_end: Some(datetime!(2026-02-01 00:00 UTC)),
            }
        );
    }

    #[test]
    fn test_one_off_invoice_is_ignored() {
        let action = translate_event(&envelope("invoice.paid", json!({ "lines": { "data": [] } })))
            .unwrap();
        assert_eq!(action, WebhookAction::Ignore);
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let action = translate_event(&envelope("charge.refunded", json!({}))).unwrap();
        assert_eq!(action, WebhookAction::Ignore);
    }

    #[test]
    fn test_unknown_provider_status_is_rejected() {
        let err = translate_event(&envelope(
            "customer.subscription.updated",
            json!({ "id": "sub_1", "customer": "cus_1", "status": "paused" }),
        ))
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[test]
    fn test_bad_tenant_metadata_is_rejected() {
        let err = translate_event(&envelope(
            "customer.subscription.created",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "metadata": { "tenant_id": "not-a-uuid" }
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    #[test]
    fn test_parse_envelope_rejects_garbage() {
        assert!(matches!(
            parse_envelope("not json"),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"type": "invoice.paid"}"#),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"id": "", "type": "x", "data": {"object": {}}}"#),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
    }

    #[test]
    fn test_signature_roundtrip() {
        let handler = handler_with_secret("whsec_test");
        let now = datetime!(2026-01-01 00:00 UTC);
        let payload = r#"{"id":"evt_1"}"#;
        let sig = compute_signature("whsec_test", now.unix_timestamp(), payload).unwrap();

        let header = format!("t={},v1={}", now.unix_timestamp(), sig);
        assert!(handler.verify_signature(payload, &header, now).is_ok());

        // A stale second signature does not hurt
        let header = format!("t={},v1=deadbeef,v1={}", now.unix_timestamp(), sig);
        assert!(handler.verify_signature(payload, &header, now).is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let handler = handler_with_secret("whsec_test");
        let now = datetime!(2026-01-01 00:00 UTC);
        let payload = r#"{"id":"evt_1"}"#;
        let ts = now.unix_timestamp();
        let sig = compute_signature("whsec_test", ts, payload).unwrap();

        // Tampered body
        let header = format!("t={},v1={}", ts, sig);
        assert!(matches!(
            handler.verify_signature(r#"{"id":"evt_2"}"#, &header, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));

        // Wrong secret
        let other = compute_signature("whsec_other", ts, payload).unwrap();
        let header = format!("t={},v1={}", ts, other);
        assert!(handler.verify_signature(payload, &header, now).is_err());

        // Too old
        let old_ts = ts - 301;
        let old = compute_signature("whsec_test", old_ts, payload).unwrap();
        let header = format!("t={},v1={}", old_ts, old);
        assert!(handler.verify_signature(payload, &header, now).is_err());

        // Missing parts
        assert!(handler.verify_signature(payload, &format!("v1={}", sig), now).is_err());
        assert!(handler.verify_signature(payload, &format!("t={}", ts), now).is_err());

        // Timestamps at the ends of the i64 range
        for extreme in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1=00", extreme);
            assert!(matches!(
                handler.verify_signature("{}", &header, now),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let handler = WebhookHandler::new(
            Arc::new(InMemoryBillingStore::new()),
            BillingConfig::default(),
        );
        let err = handler
            .verify_signature("{}", "t=1,v1=00", datetime!(2026-01-01 00:00 UTC))
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }
}
