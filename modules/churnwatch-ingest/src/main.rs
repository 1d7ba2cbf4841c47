use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use churnwatch_common::{AppConfig, PipelineConfig};
use churnwatch_ingest::{run_ingest, LineSource, MicroBatchWriter};
use churnwatch_store::{connect_with_retry, PgStore};

/// Reads newline-delimited event envelopes and writes them to Postgres in micro-batches.
#[derive(Parser)]
#[command(name = "ingest")]
struct Args {
    /// Pipeline tunables (TOML). Falls back to CHURNWATCH_CONFIG, then defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// NDJSON input file. Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let app = AppConfig::from_env()?;
    let config_path = args.config.or(app.config_path.clone());
    let pipeline = PipelineConfig::load(config_path.as_deref())?;

    info!(
        flush_size = pipeline.ingest.flush_size,
        flush_interval_ms = pipeline.ingest.flush_interval.as_millis() as u64,
        "ChurnWatch ingest starting..."
    );

    let pool = connect_with_retry(&app.database_url, &pipeline.startup.connect).await?;
    let writer = MicroBatchWriter::new(PgStore::new(pool), &pipeline.ingest);

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut source = LineSource::new(reader);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        signal.cancel();
    });

    let stats = run_ingest(&mut source, writer, shutdown).await?;
    info!(committed = source.committed(), "Ingest finished. {stats}");
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
