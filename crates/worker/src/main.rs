//! BillHook Background Worker
//!
//! Handles scheduled jobs including:
//! - Outbound task queue drain for emails and invoice records (every minute)
//! - Unmatched webhook re-resolution sweep (hourly at :10)
//! - Grace period enforcement for past-due subscriptions (hourly)
//! - Event ledger retention pruning (daily at 3:00 AM UTC)
//! - Billing invariant checks (daily at 4:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

mod outbound_processor;

use std::sync::Arc;
use std::time::Duration;

use billhook_billing::{BillingService, InvariantChecker};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = billhook_shared::create_pool(&database_url).await?;

    info!("Database pool created");
    Ok(pool)
}

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

    info!("Starting BillHook Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without webhook secrets there is nothing useful to schedule
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without billing configuration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the outbound task queue (every minute)
    // Dispatches emails and invoice records that transition transactions
    // enqueued; failures retry with backoff on their own schedule
    let drain_billing = billing.clone();
    let drain_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = drain_billing.clone();
            let pool = drain_pool.clone();
            Box::pin(async move {
                if let Err(e) = outbound_processor::drain_queue(&billing, &pool).await {
                    error!(error = %e, "Outbound queue drain failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Outbound task queue drain (every minute)");

    // Job 2: Re-resolve unmatched webhook events (hourly at :10)
    // Picks up events that arrived before their account linkage existed
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running unmatched webhook sweep");
                match billing.webhooks.resolve_unmatched(24, 100).await {
                    Ok(report) => {
                        info!(
                            examined = report.examined,
                            resolved = report.resolved,
                            still_unmatched = report.still_unmatched,
                            skipped = report.skipped,
                            "Unmatched webhook sweep complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Unmatched webhook sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Unmatched webhook sweep (hourly at :10)");

    // Job 3: Grace period enforcement (hourly)
    // Cancels past-due subscriptions whose grace window has lapsed
    let grace_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = grace_billing.clone();
            Box::pin(async move {
                info!("Running grace period enforcement job");
                match billing
                    .engine
                    .enforce_grace_expiry(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(cancelled) if cancelled > 0 => {
                        warn!(
                            cancelled = cancelled,
                            "Cancelled subscriptions past their grace window"
                        );
                    }
                    Ok(_) => info!("No subscriptions past their grace window"),
                    Err(e) => error!(error = %e, "Grace period enforcement failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period enforcement (hourly)");

    // Job 4: Prune settled ledger entries (daily at 3:00 AM UTC)
    // Unmatched entries are kept for manual review regardless of age
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                info!("Running ledger retention pruning");
                match billing.ledger.prune_terminal(90).await {
                    Ok(deleted) => {
                        info!(deleted = deleted, "Ledger retention pruning complete");
                    }
                    Err(e) => error!(error = %e, "Ledger retention pruning failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger retention pruning (daily at 3:00 AM UTC)");

    // Job 5: Billing invariant checks (daily at 4:00 AM UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        warn!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant violations found"
                        );
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                affected = violation.account_ids.len(),
                                "{}",
                                violation.description
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 4:00 AM UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "BillHook Worker started successfully with {} scheduled jobs",
        6
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
