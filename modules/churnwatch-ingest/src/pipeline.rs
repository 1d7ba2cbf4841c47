use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use churnwatch_store::RawEventSink;

use crate::router::EventRouter;
use crate::source::MessageSource;
use crate::stats::{FlushTrigger, IngestStats};
use crate::writer::MicroBatchWriter;

/// Drive messages from `source` into `writer` until the source ends or
/// `shutdown` fires, then flush whatever is left.
///
/// Size and time triggers race; whichever fires first flushes. A flush is
/// awaited inline, so no message is routed while one is in progress. The
/// source is committed only after a flush leaves every buffer empty. A flush
/// that exhausts its retries is fatal: the error is returned, carrying the
/// stats so far, and nothing past the last commit is acknowledged.
pub async fn run_ingest<M, S>(
    source: &mut M,
    mut writer: MicroBatchWriter<S>,
    shutdown: CancellationToken,
) -> Result<IngestStats>
where
    M: MessageSource,
    S: RawEventSink,
{
    let router = EventRouter::new();
    let interval = writer.flush_interval();
    let mut stats = IngestStats::default();
    let mut last_flush = Instant::now();

    info!(
        flush_interval_ms = interval.as_millis() as u64,
        "Ingest loop started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Shutdown requested, draining buffers");
                break;
            }

            _ = sleep_until(last_flush + interval) => {
                if !writer.is_empty() {
                    flush(source, &mut writer, &mut stats, FlushTrigger::Time).await?;
                }
                last_flush = Instant::now();
            }

            msg = source.next() => {
                let Some(bytes) = msg.context("Message source failed")? else {
                    info!("Message source exhausted");
                    break;
                };
                stats.received += 1;

                match router.route(&bytes, Utc::now()) {
                    Ok(event) => {
                        stats.routed += 1;
                        writer.push(event);
                    }
                    Err(malformed) => {
                        debug!(reason = %malformed.reason, detail = %malformed.detail, "Dropping malformed message");
                        stats.record_malformed(malformed.reason);
                    }
                }

                if writer.is_full() {
                    flush(source, &mut writer, &mut stats, FlushTrigger::Size).await?;
                    last_flush = Instant::now();
                }
            }
        }
    }

    flush(source, &mut writer, &mut stats, FlushTrigger::Shutdown).await?;
    writer.shutdown().await?;

    info!("Ingest complete. {stats}");
    Ok(stats)
}

async fn flush<M, S>(
    source: &mut M,
    writer: &mut MicroBatchWriter<S>,
    stats: &mut IngestStats,
    trigger: FlushTrigger,
) -> Result<()>
where
    M: MessageSource,
    S: RawEventSink,
{
    let result = writer.flush().await;
    stats.retries = writer.retries();
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(%trigger, "Flush failed, stopping ingest. {stats}");
            return Err(anyhow::Error::from(e).context(format!("Ingest aborted. {stats}")));
        }
    };
    debug!(%trigger, rows = report.total(), "Flush complete");
    stats.record_flush(trigger, &report);
    source.commit().await.context("Failed to commit source position")?;
    Ok(())
}
