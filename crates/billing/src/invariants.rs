//! Billing invariants
//!
//! Read-only SQL consistency checks. Run them after a webhook backlog is
//! replayed or a batch job misbehaves; the worker also runs them daily.
//!
//! Each check returns one [`InvariantViolation`] per offending tenant with
//! enough context to debug it. Checks never write.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access granted or billed incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    tenant_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimedKeyRow {
    key_id: Uuid,
    used_tenant_id: Uuid,
    used_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledAccessRow {
    tenant_id: Uuid,
    entitlement_id: Uuid,
    ends_at: Option<OffsetDateTime>,
    provider_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct GraceWithoutDeadlineRow {
    id: Uuid,
    name: String,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_claimed_key_has_entitlement().await?);
        violations.extend(self.check_canceled_subscription_access_revoked().await?);
        violations.extend(self.check_grace_has_deadline().await?);

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);

        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        } else {
            tracing::warn!(
                checks_run = summary.checks_run,
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// At most one live subscription per tenant
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} live subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A used key must have produced a booth entitlement for its claimant
    async fn check_claimed_key_has_entitlement(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ClaimedKeyRow> = sqlx::query_as(
            r#"
            SELECT k.key_id, k.used_tenant_id, k.used_at
            FROM license_keys k
            WHERE k.used_tenant_id IS NOT NULL
              AND k.used_at IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM entitlements e
                  WHERE e.tenant_id = k.used_tenant_id
                    AND e.source = 'booth'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "claimed_key_has_entitlement".to_string(),
                tenant_ids: vec![row.used_tenant_id],
                description: format!(
                    "License key {} was claimed but the tenant has no booth entitlement",
                    row.key_id
                ),
                context: serde_json::json!({
                    "key_id": row.key_id,
                    "used_at": row.used_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A canceled subscription keeps no live entitlement
    async fn check_canceled_subscription_access_revoked(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledAccessRow> = sqlx::query_as(
            r#"
            SELECT e.tenant_id, e.entitlement_id, e.ends_at, s.provider_subscription_id
            FROM entitlements e
            JOIN subscriptions s ON s.subscription_id = e.subscription_id
            WHERE e.revoked_at IS NULL
              AND s.status = 'canceled'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_subscription_access_revoked".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Entitlement {} is still live although subscription {} is canceled",
                    row.entitlement_id, row.provider_subscription_id
                ),
                context: serde_json::json!({
                    "entitlement_id": row.entitlement_id,
                    "provider_subscription_id": row.provider_subscription_id,
                    "ends_at": row.ends_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A tenant in grace without `grace_until` would never be suspended
    async fn check_grace_has_deadline(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GraceWithoutDeadlineRow> = sqlx::query_as(
            r#"
            SELECT id, name
            FROM tenants
            WHERE status = 'grace'
              AND grace_until IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grace_has_deadline".to_string(),
                tenant_ids: vec![row.id],
                description: format!("Tenant '{}' is in grace with no grace_until", row.name),
                context: serde_json::json!({ "tenant_name": row.name }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "claimed_key_has_entitlement" => self.check_claimed_key_has_entitlement().await,
            "canceled_subscription_access_revoked" => {
                self.check_canceled_subscription_access_revoked().await
            }
            "grace_has_deadline" => self.check_grace_has_deadline().await,
            other => Err(BillingError::InvalidInput(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "claimed_key_has_entitlement",
            "canceled_subscription_access_revoked",
            "grace_has_deadline",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            tenant_ids: vec![Uuid::now_v7()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"canceled_subscription_access_revoked"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            datetime!(2026-01-01 00:00 UTC),
            4,
            vec![
                violation("single_active_subscription"),
                violation("single_active_subscription"),
                violation("grace_has_deadline"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary =
            InvariantCheckSummary::from_violations(datetime!(2026-01-01 00:00 UTC), 4, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 4);
    }
}
