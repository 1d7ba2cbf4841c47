//! Applies pending schema migrations. Migrations are embedded at compile
//! time, so this runs as a standalone deploy step before ingest or the
//! supervisor start.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use churnwatch_common::RetryConfig;
use churnwatch_store::{connect_with_retry, MIGRATOR};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("churnwatch=info".parse()?))
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    info!("Running database migrations...");

    let pool = connect_with_retry(&database_url, &RetryConfig::default()).await?;
    MIGRATOR.run(&pool).await.context("Migration failed")?;

    info!("Migrations completed successfully.");
    Ok(())
}
