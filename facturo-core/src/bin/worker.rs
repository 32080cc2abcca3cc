use dotenv::dotenv;
use facturo_core::config::Config;
use facturo_core::db;
use facturo_core::service::BillingService;
use facturo_core::store::PgStore;
use facturo_core::worker::JobScheduler;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Worker binary entry point for the overdue sweep.
///
/// Periodically marks sent invoices past their due date as overdue and
/// records a reminder on each, spaced by `REMINDER_INTERVAL_DAYS`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(LevelFilter::INFO.into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("Starting Facturo overdue worker...");

    let config = Config::from_env()?;
    let pool = db::connect(&config.database_url, config.database_max_connections).await?;
    let service = BillingService::new(Arc::new(PgStore::new(pool)), config.billing);

    let scheduler = JobScheduler::new(
        service,
        Some(config.worker_poll_interval_seconds),
        config.reminder_interval_days,
    );

    let runner = scheduler.clone();
    let mut scheduler_handle = tokio::spawn(async move {
        if let Err(e) = runner.start().await {
            tracing::error!("Scheduler error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            scheduler.stop().await;
            scheduler_handle.abort();
        }
        _ = &mut scheduler_handle => {
            info!("Scheduler task completed");
        }
    }

    info!("Facturo overdue worker stopped");
    Ok(())
}
