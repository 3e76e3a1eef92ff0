//! Subscription mirror and its status state machine
//!
//! The provider is the source of truth for *when* a subscription changes, but
//! webhooks arrive duplicated and out of order. Every status change goes
//! through [`Subscription::update_status`], which only accepts edges present in
//! [`TRANSITIONS`]. Re-applying the current status is always accepted because
//! the provider resends `active` on every renewal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

/// Allowed non-reflexive edges, `from -> [to, ...]`
///
/// `Canceled` is absorbing. Self-transitions are handled separately.
pub const TRANSITIONS: &[(SubscriptionStatus, &[SubscriptionStatus])] = &[
    (
        SubscriptionStatus::Incomplete,
        &[SubscriptionStatus::Active, SubscriptionStatus::Canceled],
    ),
    (
        SubscriptionStatus::Trialing,
        &[
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ],
    ),
    (
        SubscriptionStatus::Active,
        &[
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
        ],
    ),
    (
        SubscriptionStatus::PastDue,
        &[
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
        ],
    ),
    (
        SubscriptionStatus::Unpaid,
        &[SubscriptionStatus::Active, SubscriptionStatus::Canceled],
    ),
    (SubscriptionStatus::Canceled, &[]),
];

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 6] = [
        SubscriptionStatus::Incomplete,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Unpaid,
        SubscriptionStatus::Canceled,
    ];

    /// Targets reachable from this status in one step
    pub fn allowed_transitions(self) -> &'static [SubscriptionStatus] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
            .unwrap_or(&[])
    }

    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        self == next || self.allowed_transitions().contains(&next)
    }

    /// Whether this status grants product access
    pub fn grants_access(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a provider status string
    ///
    /// `incomplete_expired` is terminal on the provider side and maps to
    /// `Canceled`. Anything unknown is rejected rather than guessed.
    pub fn from_provider(status: &str) -> BillingResult<Self> {
        match status {
            "incomplete_expired" => Ok(SubscriptionStatus::Canceled),
            other => other.parse(),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// Local mirror of a provider subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub provider_customer_id: String,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Mirror a subscription the first time the provider reports it
    pub fn new(
        tenant_id: Uuid,
        provider_customer_id: impl Into<String>,
        provider_subscription_id: impl Into<String>,
        status: SubscriptionStatus,
        current_period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            subscription_id: Uuid::now_v7(),
            tenant_id,
            provider_customer_id: provider_customer_id.into(),
            provider_subscription_id: provider_subscription_id.into(),
            status,
            current_period_end,
            cancel_at_period_end: false,
            cancel_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `new_status`, refreshing the period end when one is supplied
    ///
    /// Leaves `self` untouched on `InvalidTransition`.
    pub fn update_status(
        &mut self,
        now: OffsetDateTime,
        new_status: SubscriptionStatus,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(BillingError::InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        if current_period_end.is_some() {
            self.current_period_end = current_period_end;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mirror the provider's cancellation schedule. Returns true if it changed.
    pub fn schedule_cancellation(
        &mut self,
        now: OffsetDateTime,
        cancel_at_period_end: bool,
        cancel_at: Option<OffsetDateTime>,
    ) -> bool {
        if self.cancel_at_period_end == cancel_at_period_end && self.cancel_at == cancel_at {
            return false;
        }
        self.cancel_at_period_end = cancel_at_period_end;
        self.cancel_at = cancel_at;
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        Subscription::new(
            Uuid::now_v7(),
            "cus_123",
            "sub_123",
            status,
            None,
            datetime!(2026-01-01 00:00 UTC),
        )
    }

    #[test]
    fn test_table_covers_every_status() {
        for status in SubscriptionStatus::ALL {
            assert!(
                TRANSITIONS.iter().any(|(from, _)| *from == status),
                "{} missing from transition table",
                status
            );
        }
    }

    #[test]
    fn test_allowed_edges() {
        use SubscriptionStatus::*;
        assert_eq!(Incomplete.allowed_transitions(), &[Active, Canceled]);
        assert_eq!(Trialing.allowed_transitions(), &[Active, PastDue, Canceled]);
        assert_eq!(Active.allowed_transitions(), &[PastDue, Canceled, Unpaid]);
        assert_eq!(PastDue.allowed_transitions(), &[Active, Canceled, Unpaid]);
        assert_eq!(Unpaid.allowed_transitions(), &[Active, Canceled]);
        assert!(Canceled.allowed_transitions().is_empty());
    }

    #[test]
    fn test_same_status_always_succeeds() {
        let now = datetime!(2026-02-01 00:00 UTC);
        for status in SubscriptionStatus::ALL {
            let mut sub = subscription(status);
            assert!(sub.update_status(now, status, None).is_ok(), "{}", status);
            assert_eq!(sub.status, status);
        }
    }

    #[test]
    fn test_canceled_is_absorbing() {
        let now = datetime!(2026-02-01 00:00 UTC);
        for next in SubscriptionStatus::ALL {
            if next == SubscriptionStatus::Canceled {
                continue;
            }
            let mut sub = subscription(SubscriptionStatus::Canceled);
            let before = sub.clone();
            let err = sub.update_status(now, next, Some(now)).unwrap_err();
            assert!(matches!(err, BillingError::InvalidTransition { .. }));
            assert_eq!(sub, before, "rejected transition must not mutate");
        }
    }

    #[test]
    fn test_incomplete_cannot_go_past_due() {
        let mut sub = subscription(SubscriptionStatus::Incomplete);
        let err = sub
            .update_status(
                datetime!(2026-02-01 00:00 UTC),
                SubscriptionStatus::PastDue,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidTransition {
                from: SubscriptionStatus::Incomplete,
                to: SubscriptionStatus::PastDue
            }
        ));
        assert_eq!(sub.status, SubscriptionStatus::Incomplete);
    }

    #[test]
    fn test_renewal_refreshes_period_end() {
        let now = datetime!(2026-02-01 00:00 UTC);
        let next_period = datetime!(2026-03-01 00:00 UTC);
        let mut sub = subscription(SubscriptionStatus::Active);

        sub.update_status(now, SubscriptionStatus::Active, Some(next_period))
            .unwrap();
        assert_eq!(sub.current_period_end, Some(next_period));

        // A transition without a period end keeps the old one
        sub.update_status(now, SubscriptionStatus::PastDue, None)
            .unwrap();
        assert_eq!(sub.current_period_end, Some(next_period));
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired").unwrap(),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            SubscriptionStatus::from_provider("past_due").unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!(SubscriptionStatus::from_provider("paused").is_err());
    }

    #[test]
    fn test_schedule_cancellation_reports_change() {
        let now = datetime!(2026-02-01 00:00 UTC);
        let mut sub = subscription(SubscriptionStatus::Active);
        assert!(!sub.schedule_cancellation(now, false, None));
        assert!(sub.schedule_cancellation(now, true, None));
        assert!(sub.cancel_at_period_end);
        assert!(!sub.schedule_cancellation(now, true, None));
    }
}
