//! Worker configuration from environment variables

use shiftledger_billing::config::{parse_var, MAX_DAYS};
use shiftledger_billing::{BillingError, BillingResult};

/// Hourly, on the hour
pub const DEFAULT_GRACE_EXPIRY_CRON: &str = "0 0 * * * *";
/// Hourly, at half past
pub const DEFAULT_PENDING_CLEANUP_CRON: &str = "0 30 * * * *";
/// Daily at 3:00 AM UTC
pub const DEFAULT_WEBHOOK_CLEANUP_CRON: &str = "0 0 3 * * *";
/// Daily at 4:00 AM UTC
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 0 4 * * *";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub webhook_retention_days: i64,
    /// Forces every scheduled job into dry-run mode
    pub batch_dry_run: bool,
    pub grace_expiry_cron: String,
    pub pending_cleanup_cron: String,
    pub webhook_cleanup_cron: String,
    pub invariant_check_cron: String,
    /// `LOG_FORMAT=json`
    pub log_json: bool,
}

impl WorkerConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| BillingError::Config("DATABASE_URL must be set".to_string()))?;

        let webhook_retention_days = parse_var(&lookup, "WEBHOOK_RETENTION_DAYS", 30i64)?;
        if !(1..=MAX_DAYS).contains(&webhook_retention_days) {
            return Err(BillingError::Config(format!(
                "WEBHOOK_RETENTION_DAYS must be between 1 and {}",
                MAX_DAYS
            )));
        }

        let log_json = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") | Some("pretty") => false,
            Some("json") => true,
            Some(other) => {
                return Err(BillingError::Config(format!(
                    "LOG_FORMAT has invalid value '{}'",
                    other
                )))
            }
        };

        let cron = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            database_url,
            webhook_retention_days,
            batch_dry_run: parse_var(&lookup, "BATCH_DRY_RUN", false)?,
            grace_expiry_cron: cron("GRACE_EXPIRY_CRON", DEFAULT_GRACE_EXPIRY_CRON),
            pending_cleanup_cron: cron("PENDING_CLEANUP_CRON", DEFAULT_PENDING_CLEANUP_CRON),
            webhook_cleanup_cron: cron("WEBHOOK_CLEANUP_CRON", DEFAULT_WEBHOOK_CLEANUP_CRON),
            invariant_check_cron: cron("INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CHECK_CRON),
            log_json,
        })
    }
}
