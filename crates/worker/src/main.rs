//! Shiftledger Background Worker
//!
//! `serve` (the default) runs the billing lifecycle on a cron schedule:
//! - Grace expiry check (hourly)
//! - Pending payment cleanup (hourly)
//! - Webhook event retention sweep (daily at 3:00 AM UTC)
//! - Billing invariant checks (daily at 4:00 AM UTC)
//!
//! The other subcommands run one job or operator action and print the result
//! as JSON.

mod config;
mod jobs;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use shiftledger_billing::{
    ActorType, BillingConfig, BillingService, InvariantChecker, IssueKeysRequest, PgBillingStore,
};
use shiftledger_shared::{create_pool, run_migrations, DbConfig};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_cron_scheduler::JobScheduler;
use tracing::info;
use uuid::Uuid;

use crate::config::WorkerConfig;

#[derive(Debug, Parser)]
#[command(name = "shiftledger-worker", version, about = "Billing lifecycle worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all jobs on their cron schedule
    Serve,
    /// Suspend tenants whose grace period has ended
    GraceExpiry {
        #[arg(long)]
        dry_run: bool,
        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long, value_parser = parse_rfc3339)]
        now: Option<OffsetDateTime>,
    },
    /// Delete tenants that never completed payment
    PendingCleanup {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_parser = parse_rfc3339)]
        now: Option<OffsetDateTime>,
    },
    /// Delete old webhook idempotency records
    WebhookCleanup {
        /// Defaults to WEBHOOK_RETENTION_DAYS
        #[arg(long)]
        retention_days: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the read-only billing consistency checks
    CheckInvariants,
    /// Mint a batch of license keys and print the plaintext once
    IssueKeys {
        #[arg(long)]
        count: usize,
        #[arg(long)]
        batch_id: Option<String>,
        #[arg(long, value_parser = parse_rfc3339)]
        expires_at: Option<OffsetDateTime>,
        #[arg(long, default_value = "")]
        memo: String,
    },
    /// Revoke a license key by id
    RevokeKey { key_id: Uuid },
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| format!("invalid RFC 3339 time: {}", e))
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;
    init_logging(config.log_json);

    let pool = create_pool(&config.database_url, &DbConfig::default()).await?;
    let billing = Arc::new(BillingService::new(
        Arc::new(PgBillingStore::new(pool.clone())),
        BillingConfig::from_env()?,
    ));
    let dry_run_default = config.batch_dry_run;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            run_migrations(&pool).await?;
            let checker = Arc::new(InvariantChecker::new(pool));
            serve(billing, checker, &config).await?;
        }
        Commands::GraceExpiry { dry_run, now } => {
            let result = billing
                .lifecycle
                .run_grace_expiry_check(
                    now.unwrap_or_else(OffsetDateTime::now_utc),
                    dry_run || dry_run_default,
                )
                .await?;
            print_json(&result)?;
        }
        Commands::PendingCleanup { dry_run, now } => {
            let result = billing
                .lifecycle
                .run_pending_payment_cleanup(
                    now.unwrap_or_else(OffsetDateTime::now_utc),
                    dry_run || dry_run_default,
                )
                .await?;
            print_json(&result)?;
        }
        Commands::WebhookCleanup {
            retention_days,
            dry_run,
        } => {
            let result = billing
                .lifecycle
                .run_webhook_cleanup_now(
                    retention_days.unwrap_or(config.webhook_retention_days),
                    dry_run || dry_run_default,
                )
                .await?;
            print_json(&result)?;
        }
        Commands::CheckInvariants => {
            let summary = InvariantChecker::new(pool).run_all_checks().await?;
            print_json(&summary)?;
        }
        Commands::IssueKeys {
            count,
            batch_id,
            expires_at,
            memo,
        } => {
            let batch = billing
                .license_keys
                .issue_batch(
                    IssueKeysRequest {
                        count,
                        batch_id,
                        expires_at,
                        memo,
                    },
                    OffsetDateTime::now_utc(),
                )
                .await?;
            print_json(&batch)?;
        }
        Commands::RevokeKey { key_id } => {
            let key = billing
                .license_keys
                .revoke(key_id, ActorType::Operator, OffsetDateTime::now_utc())
                .await?;
            print_json(&key)?;
        }
    }

    Ok(())
}

async fn serve(
    billing: Arc<BillingService>,
    checker: Arc<InvariantChecker>,
    config: &WorkerConfig,
) -> anyhow::Result<()> {
    info!("Starting Shiftledger Worker");

    let mut scheduler = JobScheduler::new().await?;
    let jobs = jobs::schedule_all(&scheduler, billing, checker, config).await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!(
        "Shiftledger Worker started successfully with {} scheduled jobs",
        jobs
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use clap::CommandFactory;
    use time::macros::datetime;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["shiftledger-worker"]).unwrap();
        assert!(matches!(cli.command.unwrap_or(Commands::Serve), Commands::Serve));
    }

    #[test]
    fn test_grace_expiry_args() {
        let cli = Cli::try_parse_from([
            "shiftledger-worker",
            "grace-expiry",
            "--dry-run",
            "--now",
            "2026-03-10T12:00:00Z",
        ])
        .unwrap();
        match cli.command.unwrap() {
            Commands::GraceExpiry { dry_run, now } => {
                assert!(dry_run);
                assert_eq!(now, Some(datetime!(2026-03-10 12:00 UTC)));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_issue_keys_requires_count() {
        assert!(Cli::try_parse_from(["shiftledger-worker", "issue-keys"]).is_err());

        let cli = Cli::try_parse_from([
            "shiftledger-worker",
            "issue-keys",
            "--count",
            "50",
            "--batch-id",
            "fair-2026",
        ])
        .unwrap();
        match cli.command.unwrap() {
            Commands::IssueKeys {
                count, batch_id, ..
            } => {
                assert_eq!(count, 50);
                assert_eq!(batch_id.as_deref(), Some("fair-2026"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        assert!(parse_rfc3339("yesterday").is_err());
        assert!(Cli::try_parse_from(["shiftledger-worker", "revoke-key", "not-a-uuid"]).is_err());
    }
}
