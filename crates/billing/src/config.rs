//! Billing configuration loaded from the environment

use std::str::FromStr;

use time::Duration;

use crate::error::{BillingError, BillingResult};

/// Payment provider name recorded with every webhook event
pub const STRIPE_PROVIDER: &str = "stripe";

/// Upper bound for day-valued settings (grace window, retention)
pub const MAX_DAYS: i64 = 36_500;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret for provider webhook signatures (`whsec_...`)
    pub webhook_secret: Option<String>,
    /// Maximum age of a signed webhook, in seconds
    pub webhook_tolerance_secs: i64,
    /// Length of the grace window opened by a failed payment
    pub grace_period_days: i64,
    /// Plan code attached to entitlements created by license-key redemption
    pub lifetime_plan_code: String,
    /// Plan code used when a subscription carries no `plan_code` metadata
    pub default_plan_code: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            webhook_tolerance_secs: 300,
            grace_period_days: 7,
            lifetime_plan_code: "lifetime".to_string(),
            default_plan_code: "standard".to_string(),
        }
    }
}

impl BillingConfig {
    /// Load from process environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let grace_period_days = parse_var(&lookup, "GRACE_PERIOD_DAYS", defaults.grace_period_days)?;
        if !(0..=MAX_DAYS).contains(&grace_period_days) {
            return Err(BillingError::Config(format!(
                "GRACE_PERIOD_DAYS must be between 0 and {}",
                MAX_DAYS
            )));
        }
        let webhook_tolerance_secs = parse_var(
            &lookup,
            "WEBHOOK_TOLERANCE_SECS",
            defaults.webhook_tolerance_secs,
        )?;
        if webhook_tolerance_secs < 0 {
            return Err(BillingError::Config(
                "WEBHOOK_TOLERANCE_SECS must not be negative".to_string(),
            ));
        }

        Ok(Self {
            webhook_secret: lookup("WEBHOOK_SECRET").filter(|s| !s.is_empty()),
            webhook_tolerance_secs,
            grace_period_days,
            lifetime_plan_code: lookup("LIFETIME_PLAN_CODE")
                .unwrap_or(defaults.lifetime_plan_code),
            default_plan_code: lookup("DEFAULT_PLAN_CODE").unwrap_or(defaults.default_plan_code),
        })
    }
}

/// `days` whole days, or `None` if that many seconds overflow
pub fn days_duration(days: i64) -> Option<Duration> {
    days.checked_mul(86_400).map(Duration::seconds)
}

/// Parse an optional variable, falling back to `default` when unset
pub fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> BillingResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = BillingConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.grace_period_days, 7);
        assert_eq!(config.lifetime_plan_code, "lifetime");
        assert_eq!(config.default_plan_code, "standard");
    }

    #[test]
    fn test_overrides() {
        let config = BillingConfig::from_lookup(lookup_from(&[
            ("WEBHOOK_SECRET", "whsec_abc"),
            ("GRACE_PERIOD_DAYS", "14"),
            ("LIFETIME_PLAN_CODE", "booth_lifetime"),
        ]))
        .unwrap();
        assert_eq!(config.webhook_secret.as_deref(), Some("whsec_abc"));
        assert_eq!(config.grace_period_days, 14);
        assert_eq!(config.lifetime_plan_code, "booth_lifetime");
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = BillingConfig::from_lookup(lookup_from(&[("GRACE_PERIOD_DAYS", "two weeks")]))
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for (key, value) in [
            ("GRACE_PERIOD_DAYS", "-1"),
            ("GRACE_PERIOD_DAYS", "9223372036854775807"),
            ("WEBHOOK_TOLERANCE_SECS", "-300"),
        ] {
            let err = BillingConfig::from_lookup(lookup_from(&[(key, value)])).unwrap_err();
            assert!(matches!(err, BillingError::Config(_)), "{}={}", key, value);
        }
    }

    #[test]
    fn test_days_duration_overflow() {
        assert_eq!(days_duration(2), Some(Duration::days(2)));
        assert_eq!(days_duration(i64::MAX / 1000), None);
    }

    #[test]
    fn test_empty_secret_is_unset() {
        let config = BillingConfig::from_lookup(lookup_from(&[("WEBHOOK_SECRET", "")])).unwrap();
        assert!(config.webhook_secret.is_none());
    }
}
