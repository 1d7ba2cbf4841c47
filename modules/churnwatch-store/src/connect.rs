use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use churnwatch_common::{ChurnWatchError, RetryConfig};

/// Backoff for retry number `attempt` plus up to one second of jitter
/// (never more than the base delay).
pub fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let jitter_cap = retry.base_delay.min(Duration::from_secs(1)).as_millis() as u64;
    let jitter = if jitter_cap == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..jitter_cap))
    };
    retry.delay_for(attempt) + jitter
}

/// Connect to Postgres, retrying while the database comes up. Gives up with
/// `StoreExhausted` once `retry.max_attempts` connects have failed.
pub async fn connect_with_retry(database_url: &str, retry: &RetryConfig) -> Result<PgPool> {
    let mut last_error = String::new();

    for attempt in 0..retry.max_attempts {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!(attempt = attempt + 1, "Connected to Postgres");
                return Ok(pool);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < retry.max_attempts {
                    let backoff = retry_delay(retry, attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Postgres not ready, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(ChurnWatchError::StoreExhausted {
        attempts: retry.max_attempts,
        last_error,
    })
    .context("Could not connect to Postgres")
}
