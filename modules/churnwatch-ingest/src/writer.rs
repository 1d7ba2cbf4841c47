//! Micro-batch writer. Owns the three typed buffers for the life of the
//! ingest process.
//!
//! A buffer is cleared only after the sink acknowledges its bulk write. A
//! failed write is retried with the same rows; when retries run out the rows
//! stay buffered and the caller gets `StoreExhausted`.

use std::time::Duration;

use tracing::{error, info, warn};

use churnwatch_common::{
    ActivityLog, ChurnWatchError, CustomerRegistration, EventKind, IngestConfig, RawEvent,
    RetryConfig, Transaction,
};
use churnwatch_store::{retry_delay, RawEventSink};

/// What one flush wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub transactions: usize,
    pub activity_logs: usize,
    pub registrations: usize,
    pub inserted: u64,
    pub retries: u32,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.transactions + self.activity_logs + self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

pub struct MicroBatchWriter<S> {
    sink: S,
    flush_size: usize,
    flush_interval: Duration,
    retry: RetryConfig,
    transactions: Vec<Transaction>,
    activity_logs: Vec<ActivityLog>,
    registrations: Vec<CustomerRegistration>,
    /// Retries over the writer's lifetime, including flushes that failed.
    retries: u64,
}

impl<S: RawEventSink> MicroBatchWriter<S> {
    pub fn new(sink: S, config: &IngestConfig) -> Self {
        Self {
            sink,
            flush_size: config.flush_size.max(1),
            flush_interval: config.flush_interval,
            retry: config.store_retry.clone(),
            transactions: Vec::with_capacity(config.flush_size),
            activity_logs: Vec::new(),
            registrations: Vec::new(),
            retries: 0,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Combined size of all buffers.
    pub fn len(&self) -> usize {
        self.transactions.len() + self.activity_logs.len() + self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.flush_size
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn push(&mut self, event: RawEvent) {
        match event {
            RawEvent::Transaction(t) => self.transactions.push(t),
            RawEvent::ActivityLog(l) => self.activity_logs.push(l),
            RawEvent::Registration(r) => self.registrations.push(r),
        }
    }

    /// Write every non-empty buffer. Registrations go first so account links
    /// exist before the ledger rows that depend on them.
    pub async fn flush(&mut self) -> Result<FlushReport, ChurnWatchError> {
        let mut report = FlushReport::default();

        for kind in [EventKind::Registration, EventKind::Transaction, EventKind::ActivityLog] {
            let rows = self.buffered(kind);
            if rows == 0 {
                continue;
            }
            let before = report.retries;
            let result = self.flush_kind(kind, &mut report.retries).await;
            self.retries += u64::from(report.retries - before);
            let inserted = result?;
            self.clear(kind);
            report.inserted += inserted;
            match kind {
                EventKind::Transaction => report.transactions = rows,
                EventKind::ActivityLog => report.activity_logs = rows,
                EventKind::Registration => report.registrations = rows,
            }
        }

        if !report.is_empty() {
            info!(
                transactions = report.transactions,
                activity_logs = report.activity_logs,
                registrations = report.registrations,
                inserted = report.inserted,
                retries = report.retries,
                "Flushed micro-batch"
            );
        }
        Ok(report)
    }

    /// Final unconditional flush, then release the sink.
    pub async fn shutdown(mut self) -> Result<FlushReport, ChurnWatchError> {
        let pending = self.len();
        let report = self.flush().await?;
        info!(pending, "Writer shut down");
        Ok(report)
    }

    fn buffered(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Transaction => self.transactions.len(),
            EventKind::ActivityLog => self.activity_logs.len(),
            EventKind::Registration => self.registrations.len(),
        }
    }

    fn clear(&mut self, kind: EventKind) {
        match kind {
            EventKind::Transaction => self.transactions.clear(),
            EventKind::ActivityLog => self.activity_logs.clear(),
            EventKind::Registration => self.registrations.clear(),
        }
    }

    async fn write_once(&self, kind: EventKind) -> anyhow::Result<u64> {
        match kind {
            EventKind::Transaction => self.sink.write_transactions(&self.transactions).await,
            EventKind::ActivityLog => self.sink.write_activity_logs(&self.activity_logs).await,
            EventKind::Registration => self.sink.write_registrations(&self.registrations).await,
        }
    }

    async fn flush_kind(&self, kind: EventKind, retries: &mut u32) -> Result<u64, ChurnWatchError> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 0..max_attempts {
            match self.write_once(kind).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt + 1 < max_attempts => {
                    *retries += 1;
                    let backoff = retry_delay(&self.retry, attempt);
                    warn!(
                        %kind,
                        rows = self.buffered(kind),
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Bulk write failed, retrying same batch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        %kind,
                        rows = self.buffered(kind),
                        attempts = max_attempts,
                        error = %e,
                        "Bulk write retries exhausted, holding buffer"
                    );
                    return Err(ChurnWatchError::StoreExhausted {
                        attempts: max_attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        }

        Err(ChurnWatchError::StoreExhausted {
            attempts: max_attempts,
            last_error: "no attempts made".to_string(),
        })
    }
}
