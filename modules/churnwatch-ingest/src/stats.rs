use std::collections::BTreeMap;
use std::fmt;

use crate::router::MalformedReason;
use crate::writer::FlushReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Time,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size => write!(f, "size"),
            Self::Time => write!(f, "time"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Counters for one ingest run. Every received message lands in exactly one
/// of the routed or malformed buckets.
#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub received: u64,
    pub routed: u64,
    pub malformed: BTreeMap<MalformedReason, u64>,
    pub flushed_transactions: u64,
    pub flushed_activity_logs: u64,
    pub flushed_registrations: u64,
    /// Rows that were new to the store (replays are flushed but not inserted).
    pub inserted: u64,
    pub size_flushes: u64,
    pub time_flushes: u64,
    pub shutdown_flushes: u64,
    pub retries: u64,
}

impl IngestStats {
    pub fn record_malformed(&mut self, reason: MalformedReason) {
        *self.malformed.entry(reason).or_default() += 1;
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed.values().sum()
    }

    pub fn record_flush(&mut self, trigger: FlushTrigger, report: &FlushReport) {
        if report.is_empty() {
            return;
        }
        match trigger {
            FlushTrigger::Size => self.size_flushes += 1,
            FlushTrigger::Time => self.time_flushes += 1,
            FlushTrigger::Shutdown => self.shutdown_flushes += 1,
        }
        self.flushed_transactions += report.transactions as u64;
        self.flushed_activity_logs += report.activity_logs as u64;
        self.flushed_registrations += report.registrations as u64;
        self.inserted += report.inserted;
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} routed={} malformed={} flushed(txn={} log={} user={}) inserted={} flushes(size={} time={} shutdown={}) retries={}",
            self.received,
            self.routed,
            self.malformed_total(),
            self.flushed_transactions,
            self.flushed_activity_logs,
            self.flushed_registrations,
            self.inserted,
            self.size_flushes,
            self.time_flushes,
            self.shutdown_flushes,
            self.retries,
        )?;
        for (reason, count) in &self.malformed {
            write!(f, " {reason}={count}")?;
        }
        Ok(())
    }
}
