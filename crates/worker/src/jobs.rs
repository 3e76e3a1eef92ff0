//! Cron jobs driving the billing lifecycle

use std::sync::Arc;

use shiftledger_billing::{BillingService, InvariantChecker};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Register every lifecycle job on `scheduler`. Returns the number of jobs added.
pub async fn schedule_all(
    scheduler: &JobScheduler,
    billing: Arc<BillingService>,
    checker: Arc<InvariantChecker>,
    config: &WorkerConfig,
) -> anyhow::Result<usize> {
    let dry_run = config.batch_dry_run;
    if dry_run {
        warn!("BATCH_DRY_RUN is set, scheduled jobs will not write");
    }

    // Job 1: Suspend tenants whose grace period has ended
    let grace_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.grace_expiry_cron.as_str(),
            move |_uuid, _l| {
                let billing = grace_billing.clone();
                Box::pin(async move {
                    info!("Running grace expiry check");
                    match billing.lifecycle.run_grace_expiry_check_now(dry_run).await {
                        Ok(result) => info!(
                            expired = result.expired_tenants.len(),
                            suspended = result.suspended_count,
                            failed = result.failed_count,
                            dry_run = result.dry_run,
                            "Grace expiry check complete"
                        ),
                        Err(e) => error!(error = %e, "Grace expiry check failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.grace_expiry_cron, "Scheduled: Grace expiry check");

    // Job 2: Delete signups that never paid
    let pending_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.pending_cleanup_cron.as_str(),
            move |_uuid, _l| {
                let billing = pending_billing.clone();
                Box::pin(async move {
                    info!("Running pending payment cleanup");
                    match billing
                        .lifecycle
                        .run_pending_payment_cleanup_now(dry_run)
                        .await
                    {
                        Ok(result) => info!(
                            expired = result.expired_tenants.len(),
                            deleted = result.deleted_count,
                            failed = result.failed_count,
                            dry_run = result.dry_run,
                            "Pending payment cleanup complete"
                        ),
                        Err(e) => error!(error = %e, "Pending payment cleanup failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.pending_cleanup_cron, "Scheduled: Pending payment cleanup");

    // Job 3: Webhook idempotency record retention
    let webhook_billing = billing;
    let retention_days = config.webhook_retention_days;
    scheduler
        .add(Job::new_async(
            config.webhook_cleanup_cron.as_str(),
            move |_uuid, _l| {
                let billing = webhook_billing.clone();
                Box::pin(async move {
                    info!(retention_days = retention_days, "Running webhook event cleanup");
                    if let Err(e) = billing
                        .lifecycle
                        .run_webhook_cleanup_now(retention_days, dry_run)
                        .await
                    {
                        error!(error = %e, "Webhook event cleanup failed");
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.webhook_cleanup_cron, "Scheduled: Webhook event cleanup");

    // Job 4: Consistency checks (read-only, logs its own summary)
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let checker = checker.clone();
                Box::pin(async move {
                    info!("Running billing invariant checks");
                    match checker.run_all_checks().await {
                        Ok(summary) => {
                            for violation in &summary.violations {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    tenant_ids = ?violation.tenant_ids,
                                    "{}",
                                    violation.description
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "Billing invariant checks failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariant_check_cron, "Scheduled: Billing invariant checks");

    // Job 5: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    Ok(5)
}
