use dotenv::dotenv;
use facturo_core::api::{create_router, AppState};
use facturo_core::auth::AuthKeys;
use facturo_core::config::Config;
use facturo_core::db;
use facturo_core::service::BillingService;
use facturo_core::store::PgStore;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(LevelFilter::INFO.into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("Starting Facturo Core Server...");

    let config = Config::from_env()?;
    let pool = db::connect(&config.database_url, config.database_max_connections).await?;

    let state = AppState {
        service: BillingService::new(Arc::new(PgStore::new(pool)), config.billing),
        auth: AuthKeys::from_secret(&config.jwt_secret),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind((config.server_host.as_str(), config.server_port))
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to bind to {}:{}: {}",
                config.server_host,
                config.server_port,
                e
            )
        })?;

    info!("Server listening on {}:{}", config.server_host, config.server_port);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
