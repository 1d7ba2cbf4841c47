use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use churnwatch_common::{AppConfig, PipelineConfig};
use churnwatch_store::{connect_with_retry, PgStore};
use churnwatch_supervisor::{ClaudeGenerator, Supervisor};

/// Periodically recomputes churn risk and dispatches retention emails.
#[derive(Parser)]
#[command(name = "supervisor")]
struct Args {
    /// Pipeline tunables (TOML). Falls back to CHURNWATCH_CONFIG, then defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("ChurnWatch supervisor starting...");

    let args = Args::parse();
    let app = AppConfig::from_env()?;
    let config_path = args.config.or(app.config_path.clone());
    let pipeline = PipelineConfig::load(config_path.as_deref())?;

    let api_key = app
        .anthropic_api_key
        .as_deref()
        .context("ANTHROPIC_API_KEY environment variable is required")?;
    let generator = ClaudeGenerator::new(api_key, &pipeline.actions.model);
    info!(model = generator.model(), "Generation backend ready");

    let pool = connect_with_retry(&app.database_url, &pipeline.startup.connect).await?;
    let supervisor = Supervisor::new(PgStore::new(pool), generator, &pipeline);

    if args.once {
        match supervisor.run_cycle(Utc::now()).await? {
            Some(stats) => info!("Supervisor complete. {stats}"),
            None => warn!("Cycle skipped, another supervisor is running"),
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        signal.cancel();
    });

    supervisor.run(pipeline.scoring.cadence, shutdown).await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("churnwatch=info"));
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
