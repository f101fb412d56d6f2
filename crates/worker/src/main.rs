//! Billing worker
//!
//! Cron-driven executor for the time-based parts of the billing engine:
//! due payment retries, scheduled next-cycle plan changes, and
//! period-end cancellations. All schedules live in the database; this
//! process only supplies the clock.

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use pawket_billing::{DunningEngine, GatewayClient, SubscriptionService};
use pawket_shared::PlanCatalog;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pawket_worker=info,pawket_billing=info".into()),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = pawket_shared::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;

    let migration_pool = pawket_shared::create_migration_pool(&database_url)
        .await
        .context("Failed to connect for migrations")?;
    pawket_shared::run_migrations(&migration_pool)
        .await
        .context("Failed to run migrations")?;
    migration_pool.close().await;

    let gateway = GatewayClient::from_env().context("Gateway config incomplete")?;
    let catalog = PlanCatalog::default_catalog();

    let dunning = Arc::new(DunningEngine::new(pool.clone(), gateway, catalog.clone()));
    let subscriptions = Arc::new(SubscriptionService::new(pool.clone(), catalog));

    let scheduler = JobScheduler::new().await?;

    // Due retries every minute
    let engine = dunning.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_id, _sched| {
            let engine = engine.clone();
            Box::pin(async move {
                jobs::process_due_retries(&engine).await;
            })
        })?)
        .await?;

    // Scheduled plan changes every 5 minutes
    let subs = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_id, _sched| {
            let subs = subs.clone();
            Box::pin(async move {
                jobs::apply_scheduled_changes(&subs).await;
            })
        })?)
        .await?;

    // Period-end cancellations hourly
    let subs = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_id, _sched| {
            let subs = subs.clone();
            Box::pin(async move {
                jobs::finalize_cancellations(&subs).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Billing worker started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down billing worker");

    Ok(())
}
