// Store boundaries. Each record kind has exactly one writer role:
//
// RawEventSink   -> the ingest writer (raw events)
// AggregateStore -> the windowed aggregator (materialized risk)
// ActionStore    -> the action dispatcher (retention actions)
//
// PgStore backs production, MemoryStore backs tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use churnwatch_common::{
    ActionRecord, ActivityLog, AggregateRecord, CustomerRegistration, Transaction, WindowSnapshot,
};

// ---------------------------------------------------------------------------
// RawEventSink
// ---------------------------------------------------------------------------

/// Bulk, idempotent writes of raw events. Each call is one transaction;
/// rows whose natural key already exists are skipped, so a replayed batch
/// never duplicates. Returns the number of rows actually inserted.
#[async_trait]
pub trait RawEventSink: Send + Sync {
    async fn write_transactions(&self, batch: &[Transaction]) -> Result<u64>;
    async fn write_activity_logs(&self, batch: &[ActivityLog]) -> Result<u64>;
    async fn write_registrations(&self, batch: &[CustomerRegistration]) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// WindowReader
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WindowReader: Send + Sync {
    /// Point-in-time read of every raw event in `[from, to)` plus the
    /// account links needed to attribute ledger rows to customers.
    async fn read_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowSnapshot>;
}

// ---------------------------------------------------------------------------
// AggregateStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// The last materialization, in entity id order.
    async fn load_aggregates(&self) -> Result<Vec<AggregateRecord>>;

    /// Replace the whole materialization atomically.
    async fn replace_aggregates(&self, records: &[AggregateRecord]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ActionStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn latest_action_at(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Insert unless an action already holds `(entity_id, cooldown_bucket)`.
    /// Returns false when the slot was taken.
    async fn record_action(&self, action: &ActionRecord, cooldown_bucket: i64) -> Result<bool>;

    async fn actions_for(&self, entity_id: &str) -> Result<Vec<ActionRecord>>;
}

// ---------------------------------------------------------------------------
// CycleLock
// ---------------------------------------------------------------------------

/// Cross-process single-flight for the recomputation cycle.
#[async_trait]
pub trait CycleLock: Send + Sync {
    /// Returns false if another cycle holds a lock younger than `stale_after`.
    async fn acquire_cycle_lock(&self, stale_after: Duration) -> Result<bool>;
    async fn release_cycle_lock(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ContextSource
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Free-text snippets about an entity, newest first.
    async fn context_for(&self, entity_id: &str) -> Result<Vec<String>>;
}

/// Everything the recomputation cycle reads and writes.
pub trait CycleStore: WindowReader + AggregateStore + ActionStore + CycleLock + ContextSource {}

impl<T> CycleStore for T where T: WindowReader + AggregateStore + ActionStore + CycleLock + ContextSource {}

// ---------------------------------------------------------------------------
// Arc passthroughs
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: RawEventSink + ?Sized> RawEventSink for Arc<S> {
    async fn write_transactions(&self, batch: &[Transaction]) -> Result<u64> {
        (**self).write_transactions(batch).await
    }

    async fn write_activity_logs(&self, batch: &[ActivityLog]) -> Result<u64> {
        (**self).write_activity_logs(batch).await
    }

    async fn write_registrations(&self, batch: &[CustomerRegistration]) -> Result<u64> {
        (**self).write_registrations(batch).await
    }
}

#[async_trait]
impl<S: WindowReader + ?Sized> WindowReader for Arc<S> {
    async fn read_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowSnapshot> {
        (**self).read_window(from, to).await
    }
}

#[async_trait]
impl<S: AggregateStore + ?Sized> AggregateStore for Arc<S> {
    async fn load_aggregates(&self) -> Result<Vec<AggregateRecord>> {
        (**self).load_aggregates().await
    }

    async fn replace_aggregates(&self, records: &[AggregateRecord]) -> Result<()> {
        (**self).replace_aggregates(records).await
    }
}

#[async_trait]
impl<S: ActionStore + ?Sized> ActionStore for Arc<S> {
    async fn latest_action_at(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).latest_action_at(entity_id).await
    }

    async fn record_action(&self, action: &ActionRecord, cooldown_bucket: i64) -> Result<bool> {
        (**self).record_action(action, cooldown_bucket).await
    }

    async fn actions_for(&self, entity_id: &str) -> Result<Vec<ActionRecord>> {
        (**self).actions_for(entity_id).await
    }
}

#[async_trait]
impl<S: CycleLock + ?Sized> CycleLock for Arc<S> {
    async fn acquire_cycle_lock(&self, stale_after: Duration) -> Result<bool> {
        (**self).acquire_cycle_lock(stale_after).await
    }

    async fn release_cycle_lock(&self) -> Result<()> {
        (**self).release_cycle_lock().await
    }
}

#[async_trait]
impl<S: ContextSource + ?Sized> ContextSource for Arc<S> {
    async fn context_for(&self, entity_id: &str) -> Result<Vec<String>> {
        (**self).context_for(entity_id).await
    }
}
