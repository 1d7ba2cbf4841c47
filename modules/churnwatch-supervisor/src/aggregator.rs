//! Windowed aggregation: a full, stateless recomputation of every entity's
//! risk from the raw events inside the trailing window.
//!
//! Ledger rows carry an account id, not a customer id. They are attributed
//! through the account links written at registration time; an account with
//! no link stands in as its own entity.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use churnwatch_common::{AggregateRecord, RiskFeatures, RiskRules, WindowSnapshot};
use churnwatch_store::{AggregateStore, WindowReader};

#[derive(Default)]
struct Counters {
    txn_count: i64,
    total_spend: f64,
    wire_out_total: f64,
    error_count: i64,
    support_cases: i64,
    sentiment_sum: f64,
    sentiment_samples: i64,
    active_days: BTreeSet<NaiveDate>,
}

/// Pure recomputation. Output is sorted by entity id and depends only on the
/// arguments, so identical inputs give identical records.
pub fn aggregate(
    snapshot: &WindowSnapshot,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    computed_at: DateTime<Utc>,
    rules: &RiskRules,
) -> Vec<AggregateRecord> {
    let owners: HashMap<&str, &str> = snapshot
        .account_links
        .iter()
        .map(|l| (l.account_id.as_str(), l.customer_id.as_str()))
        .collect();

    let mut entities: BTreeMap<String, Counters> = BTreeMap::new();

    for t in &snapshot.transactions {
        let entity = owners
            .get(t.account_id.as_str())
            .copied()
            .unwrap_or(t.account_id.as_str());
        let c = entities.entry(entity.to_string()).or_default();
        c.txn_count += 1;
        c.total_spend += t.amount;
        if t.is_wire_out() {
            c.wire_out_total += t.amount;
        }
    }

    for l in &snapshot.activity_logs {
        let c = entities.entry(l.customer_id.clone()).or_default();
        if l.error_code.is_some() {
            c.error_count += 1;
        }
        c.active_days.insert(l.event_timestamp.date_naive());
    }

    for s in &snapshot.support_cases {
        let c = entities.entry(s.customer_id.clone()).or_default();
        c.support_cases += 1;
        if let Some(score) = s.sentiment_score.filter(|v| v.is_finite()) {
            c.sentiment_sum += score;
            c.sentiment_samples += 1;
        }
    }

    entities
        .into_iter()
        .map(|(entity_id, c)| {
            let avg_sentiment = if c.sentiment_samples > 0 {
                c.sentiment_sum / c.sentiment_samples as f64
            } else {
                rules.default_sentiment
            };
            let features = RiskFeatures {
                wire_out_total: c.wire_out_total,
                support_cases: c.support_cases,
                avg_sentiment,
                error_count: c.error_count,
                active_days: c.active_days.len() as i64,
            };
            let (churn_score, risk_class) = rules.assess(&features);

            AggregateRecord {
                entity_id,
                window_start,
                window_end,
                txn_count: c.txn_count,
                total_spend: c.total_spend,
                wire_out_total: features.wire_out_total,
                error_count: features.error_count,
                support_cases: features.support_cases,
                avg_sentiment,
                active_days: features.active_days,
                churn_score,
                risk_class,
                computed_at,
            }
        })
        .collect()
}

/// Read, recompute and replace the materialized aggregates.
pub struct WindowedAggregator {
    window: Duration,
    rules: RiskRules,
}

impl WindowedAggregator {
    pub fn new(window: Duration, rules: RiskRules) -> Self {
        Self { window, rules }
    }

    pub fn rules(&self) -> &RiskRules {
        &self.rules
    }

    pub async fn recompute<S>(&self, store: &S, now: DateTime<Utc>) -> Result<Vec<AggregateRecord>>
    where
        S: WindowReader + AggregateStore,
    {
        let window = chrono::Duration::from_std(self.window).context("Aggregation window out of range")?;
        let window_start = now - window;

        let snapshot = store
            .read_window(window_start, now)
            .await
            .context("Failed to read aggregation window")?;
        let records = aggregate(&snapshot, window_start, now, now, &self.rules);
        store
            .replace_aggregates(&records)
            .await
            .context("Failed to replace aggregates")?;

        info!(
            transactions = snapshot.transactions.len(),
            activity_logs = snapshot.activity_logs.len(),
            support_cases = snapshot.support_cases.len(),
            entities = records.len(),
            "Recomputed aggregates"
        );
        Ok(records)
    }
}
