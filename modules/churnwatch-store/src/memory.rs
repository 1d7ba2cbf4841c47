//! In-memory implementation of every store trait.
//!
//! Mirrors the Postgres semantics that matter to callers: natural-key
//! idempotence for raw events, half-open window reads, atomic aggregate
//! replacement, and the `(entity, cooldown_bucket)` uniqueness on actions.
//! Failure injection lets tests drive the retry and deferral paths without a
//! database.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use churnwatch_common::{
    AccountLink, ActionRecord, ActivityLog, AggregateRecord, CustomerRegistration, EventKind,
    SupportCase, Transaction, WindowSnapshot,
};

use crate::traits::{
    ActionStore, AggregateStore, ContextSource, CycleLock, RawEventSink, WindowReader,
};

/// One acknowledged bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedBatch {
    pub kind: EventKind,
    pub rows: usize,
}

#[derive(Default)]
struct Inner {
    transactions: BTreeMap<String, Transaction>,
    activity_logs: BTreeMap<String, ActivityLog>,
    customers: BTreeMap<String, CustomerRegistration>,
    account_links: BTreeMap<String, String>,
    support_cases: BTreeMap<String, SupportCase>,
    aggregates: Vec<AggregateRecord>,
    actions: Vec<(ActionRecord, i64)>,
    cycle_lock: Option<DateTime<Utc>>,
    committed: Vec<CommittedBatch>,
    write_attempts: u64,
    fail_next_writes: u32,
    fail_context: bool,
    fail_aggregate_writes: bool,
}

/// Shared handle; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `n` raw-event writes fail before touching any data.
    pub fn fail_next_writes(&self, n: u32) {
        self.state().fail_next_writes = n;
    }

    pub fn fail_context_reads(&self, fail: bool) {
        self.state().fail_context = fail;
    }

    pub fn fail_aggregate_writes(&self, fail: bool) {
        self.state().fail_aggregate_writes = fail;
    }

    /// Support cases arrive from outside the pipeline.
    pub fn insert_support_case(&self, case: SupportCase) {
        self.state().support_cases.insert(case.case_id.clone(), case);
    }

    pub fn link_account(&self, account_id: &str, customer_id: &str) {
        self.state()
            .account_links
            .insert(account_id.to_string(), customer_id.to_string());
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().transactions.values().cloned().collect()
    }

    pub fn activity_logs(&self) -> Vec<ActivityLog> {
        self.state().activity_logs.values().cloned().collect()
    }

    pub fn registrations(&self) -> Vec<CustomerRegistration> {
        self.state().customers.values().cloned().collect()
    }

    pub fn committed_batches(&self) -> Vec<CommittedBatch> {
        self.state().committed.clone()
    }

    /// Every write call, including injected failures.
    pub fn write_attempts(&self) -> u64 {
        self.state().write_attempts
    }

    pub fn all_actions(&self) -> Vec<ActionRecord> {
        self.state().actions.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn clear_actions(&self) {
        self.state().actions.clear();
    }

    fn begin_write(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.state();
        inner.write_attempts += 1;
        if inner.fail_next_writes > 0 {
            inner.fail_next_writes -= 1;
            anyhow::bail!("injected store failure");
        }
        Ok(inner)
    }
}

fn insert_new<T: Clone>(map: &mut BTreeMap<String, T>, rows: &[T], key: impl Fn(&T) -> &str) -> u64 {
    let mut inserted = 0;
    for row in rows {
        let k = key(row);
        if !map.contains_key(k) {
            map.insert(k.to_string(), row.clone());
            inserted += 1;
        }
    }
    inserted
}

#[async_trait]
impl RawEventSink for MemoryStore {
    async fn write_transactions(&self, batch: &[Transaction]) -> Result<u64> {
        let mut inner = self.begin_write()?;
        let inserted = insert_new(&mut inner.transactions, batch, |t| t.transaction_ref.as_str());
        inner.committed.push(CommittedBatch {
            kind: EventKind::Transaction,
            rows: batch.len(),
        });
        Ok(inserted)
    }

    async fn write_activity_logs(&self, batch: &[ActivityLog]) -> Result<u64> {
        let mut inner = self.begin_write()?;
        let inserted = insert_new(&mut inner.activity_logs, batch, |l| l.log_id.as_str());
        inner.committed.push(CommittedBatch {
            kind: EventKind::ActivityLog,
            rows: batch.len(),
        });
        Ok(inserted)
    }

    async fn write_registrations(&self, batch: &[CustomerRegistration]) -> Result<u64> {
        let mut inner = self.begin_write()?;
        let inserted = insert_new(&mut inner.customers, batch, |c| c.customer_id.as_str());
        for registration in batch {
            for account_id in &registration.account_ids {
                inner
                    .account_links
                    .entry(account_id.clone())
                    .or_insert_with(|| registration.customer_id.clone());
            }
        }
        inner.committed.push(CommittedBatch {
            kind: EventKind::Registration,
            rows: batch.len(),
        });
        Ok(inserted)
    }
}

#[async_trait]
impl WindowReader for MemoryStore {
    async fn read_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowSnapshot> {
        let inner = self.state();
        let in_window = |at: &DateTime<Utc>| *at >= from && *at < to;

        Ok(WindowSnapshot {
            transactions: inner
                .transactions
                .values()
                .filter(|t| in_window(&t.posting_date))
                .cloned()
                .collect(),
            activity_logs: inner
                .activity_logs
                .values()
                .filter(|l| in_window(&l.event_timestamp))
                .cloned()
                .collect(),
            support_cases: inner
                .support_cases
                .values()
                .filter(|c| in_window(&c.opened_at))
                .cloned()
                .collect(),
            account_links: inner
                .account_links
                .iter()
                .map(|(account_id, customer_id)| AccountLink {
                    account_id: account_id.clone(),
                    customer_id: customer_id.clone(),
                })
                .collect(),
        })
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn load_aggregates(&self) -> Result<Vec<AggregateRecord>> {
        let mut records = self.state().aggregates.clone();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(records)
    }

    async fn replace_aggregates(&self, records: &[AggregateRecord]) -> Result<()> {
        let mut inner = self.state();
        if inner.fail_aggregate_writes {
            anyhow::bail!("injected aggregate write failure");
        }
        inner.aggregates = records.to_vec();
        Ok(())
    }
}

#[async_trait]
impl ActionStore for MemoryStore {
    async fn latest_action_at(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .actions
            .iter()
            .filter(|(a, _)| a.entity_id == entity_id)
            .map(|(a, _)| a.created_at)
            .max())
    }

    async fn record_action(&self, action: &ActionRecord, cooldown_bucket: i64) -> Result<bool> {
        let mut inner = self.state();
        let taken = inner
            .actions
            .iter()
            .any(|(a, bucket)| a.entity_id == action.entity_id && *bucket == cooldown_bucket);
        if taken {
            return Ok(false);
        }
        inner.actions.push((action.clone(), cooldown_bucket));
        Ok(true)
    }

    async fn actions_for(&self, entity_id: &str) -> Result<Vec<ActionRecord>> {
        let mut actions: Vec<ActionRecord> = self
            .state()
            .actions
            .iter()
            .filter(|(a, _)| a.entity_id == entity_id)
            .map(|(a, _)| a.clone())
            .collect();
        actions.sort_by_key(|a| a.created_at);
        Ok(actions)
    }
}

#[async_trait]
impl CycleLock for MemoryStore {
    async fn acquire_cycle_lock(&self, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after)?;
        let mut inner = self.state();
        match inner.cycle_lock {
            Some(started_at) if now - started_at < stale_after => Ok(false),
            _ => {
                inner.cycle_lock = Some(now);
                Ok(true)
            }
        }
    }

    async fn release_cycle_lock(&self) -> Result<()> {
        self.state().cycle_lock = None;
        Ok(())
    }
}

#[async_trait]
impl ContextSource for MemoryStore {
    async fn context_for(&self, entity_id: &str) -> Result<Vec<String>> {
        let inner = self.state();
        if inner.fail_context {
            anyhow::bail!("injected context read failure");
        }
        let mut cases: Vec<&SupportCase> = inner
            .support_cases
            .values()
            .filter(|c| c.customer_id == entity_id)
            .collect();
        cases.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        Ok(cases
            .into_iter()
            .filter_map(|c| c.transcript.clone())
            .filter(|t| !t.trim().is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn txn(reference: &str, at: DateTime<Utc>) -> Transaction {
        Transaction {
            transaction_ref: reference.to_string(),
            account_id: "ACC-1".to_string(),
            posting_date: at,
            transaction_code: "POS".to_string(),
            amount: 10.0,
            merchant_description: None,
            merchant_category_code: None,
            channel_id: None,
            received_at: at,
        }
    }

    #[tokio::test]
    async fn replayed_batch_inserts_nothing() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let batch = vec![txn("T1", at), txn("T2", at)];

        assert_eq!(store.write_transactions(&batch).await.unwrap(), 2);
        assert_eq!(store.write_transactions(&batch).await.unwrap(), 0);
        assert_eq!(store.transactions().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_leave_data_untouched() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        store.fail_next_writes(1);

        assert!(store.write_transactions(&[txn("T1", at)]).await.is_err());
        assert!(store.transactions().is_empty());
        assert_eq!(store.write_transactions(&[txn("T1", at)]).await.unwrap(), 1);
        assert_eq!(store.write_attempts(), 2);
        assert_eq!(store.committed_batches().len(), 1);
    }

    #[tokio::test]
    async fn window_is_half_open() {
        let store = MemoryStore::new();
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        store
            .write_transactions(&[txn("AT_FROM", from), txn("AT_TO", to)])
            .await
            .unwrap();

        let snapshot = store.read_window(from, to).await.unwrap();
        let refs: Vec<&str> = snapshot
            .transactions
            .iter()
            .map(|t| t.transaction_ref.as_str())
            .collect();
        assert_eq!(refs, vec!["AT_FROM"]);
    }

    #[tokio::test]
    async fn cooldown_bucket_is_unique_per_entity() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let action = |entity: &str| ActionRecord {
            id: uuid::Uuid::new_v4(),
            entity_id: entity.to_string(),
            churn_score: 0.9,
            reason: churnwatch_common::ReasonCode::CriticalRiskDetected,
            generated_content: "hello".to_string(),
            created_at: at,
        };

        assert!(store.record_action(&action("C1"), 7).await.unwrap());
        assert!(!store.record_action(&action("C1"), 7).await.unwrap());
        assert!(store.record_action(&action("C2"), 7).await.unwrap());
        assert_eq!(store.latest_action_at("C1").await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn cycle_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let stale = Duration::from_secs(1800);

        assert!(store.acquire_cycle_lock(stale).await.unwrap());
        assert!(!store.acquire_cycle_lock(stale).await.unwrap());
        store.release_cycle_lock().await.unwrap();
        assert!(store.acquire_cycle_lock(stale).await.unwrap());
    }

    #[tokio::test]
    async fn context_is_newest_first_and_skips_blank_transcripts() {
        let store = MemoryStore::new();
        let case = |id: &str, day: u32, transcript: Option<&str>| SupportCase {
            case_id: id.to_string(),
            customer_id: "C1".to_string(),
            opened_at: Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap(),
            channel: None,
            category: None,
            sentiment_score: Some(0.2),
            transcript: transcript.map(str::to_string),
        };
        store.insert_support_case(case("S1", 1, Some("first")));
        store.insert_support_case(case("S2", 3, Some("third")));
        store.insert_support_case(case("S3", 2, Some("  ")));
        store.insert_support_case(case("S4", 4, None));

        assert_eq!(store.context_for("C1").await.unwrap(), vec!["third", "first"]);
    }
}
