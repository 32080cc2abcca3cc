use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Create a Postgres connection pool and bring the schema up to date.
///
/// Returns a `sqlx::PgPool` or an error if the database cannot be reached
/// or a migration fails.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    info!(max_connections, "Connecting to PostgreSQL");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    info!("Database ready");
    Ok(pool)
}
