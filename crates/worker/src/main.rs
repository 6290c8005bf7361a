//! TrueVault Background Worker
//!
//! Drives the time-based billing jobs:
//! - Billing sweep every 5 minutes: due revocations, auto-expiry, expiry
//!   warnings, bounded payment retries, stale pending orders, and
//!   first-of-month renewal invoices
//! - Webhook log cleanup (daily at 3:30 UTC)

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use truevault_billing::BillingService;
use truevault_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting TrueVault Worker");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://data/truevault.db".to_string());
    let pool = db::create_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let billing = Arc::new(
        BillingService::from_env(pool).map_err(|e| anyhow::anyhow!("billing: {e}"))?,
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing sweep every 5 minutes
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running billing sweep");
                match billing.maintenance.run_sweep().await {
                    Ok(report) => {
                        info!(
                            revocations = report.revocations,
                            expired = report.expired_subscriptions,
                            vip_extensions = report.vip_extensions,
                            warnings = report.expiry_warnings,
                            retries = report.payment_retries,
                            stale_orders = report.stale_orders,
                            renewal_invoices = report.renewal_invoices,
                            "Billing sweep finished"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Billing sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: billing sweep (every 5 minutes)");

    // Job 2: Webhook log cleanup (daily at 3:30 UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.maintenance.cleanup_webhook_log().await {
                    error!(error = %e, "Webhook log cleanup failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: webhook log cleanup (daily)");

    scheduler.start().await?;
    info!("Worker running");

    // The scheduler drives everything; keep the process alive.
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
