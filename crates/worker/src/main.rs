//! Vitrina Background Worker
//!
//! Handles scheduled jobs including:
//! - Stale webhook event retry sweep (every minute)
//! - Pending payment polling fallback against Mercado Pago (every 15 minutes)
//! - Expired paid plan demotion (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use vitrina_billing::BillingService;
use vitrina_shared::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Vitrina Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(
        BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("billing service init failed: {}", e))?,
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry stale unprocessed webhook events (every minute)
    // Covers abandoned claims (worker crash mid-event) and events whose
    // inline processing hit a transient failure.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.sweep.run_once().await {
                    error!(error = %e, "Stale event sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale event sweep (every minute)");

    // Job 2: Poll Mercado Pago for payments stuck pending (every 15 minutes)
    // Fallback for webhooks the provider dropped or that failed signature
    // verification on every delivery attempt.
    let poll_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = poll_billing.clone();
            Box::pin(async move {
                info!("Running pending payment polling fallback");
                if let Err(e) = billing.sweep.poll_pending_payments().await {
                    error!(error = %e, "Pending payment poll failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Pending payment polling fallback (every 15 minutes)");

    // Job 3: Demote expired paid plans to free (hourly)
    let expiry_billing = billing.clone();
    let expiry_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            let pool = expiry_pool.clone();
            Box::pin(async move {
                info!("Running plan expiry demotion job");
                match billing.subscriptions.demote_expired(&pool).await {
                    Ok(demoted) => info!(demoted = demoted, "Plan expiry demotion complete"),
                    Err(e) => error!(error = %e, "Plan expiry demotion failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Plan expiry demotion (hourly)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Vitrina Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
