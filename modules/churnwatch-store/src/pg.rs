//! Postgres implementation of the store traits.
//!
//! Raw-event writes are chunked `INSERT .. ON CONFLICT DO NOTHING` inside a
//! single transaction per call, so a reader never observes half a flush and a
//! replay after a crash inserts nothing twice.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use churnwatch_common::{
    AccountLink, ActionRecord, ActivityLog, AggregateRecord, CustomerRegistration, RiskClass,
    RiskScore, SupportCase, Transaction, WindowSnapshot,
};

use crate::traits::{
    ActionStore, AggregateStore, ContextSource, CycleLock, RawEventSink, WindowReader,
};

/// Stays well under Postgres' 65535 bind-parameter ceiling for the widest table.
const INSERT_CHUNK_ROWS: usize = 1_000;

const CYCLE_LOCK_NAME: &str = "aggregation_cycle";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    /// Identifies this process as the holder of the cycle lock.
    holder: Uuid,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct TransactionRow {
    transaction_ref: String,
    account_id: String,
    posting_date: DateTime<Utc>,
    transaction_code: String,
    amount: f64,
    merchant_description: Option<String>,
    merchant_category_code: Option<String>,
    channel_id: Option<String>,
    received_at: DateTime<Utc>,
}

impl From<TransactionRow> for Transaction {
    fn from(r: TransactionRow) -> Self {
        Self {
            transaction_ref: r.transaction_ref,
            account_id: r.account_id,
            posting_date: r.posting_date,
            transaction_code: r.transaction_code,
            amount: r.amount,
            merchant_description: r.merchant_description,
            merchant_category_code: r.merchant_category_code,
            channel_id: r.channel_id,
            received_at: r.received_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActivityLogRow {
    log_id: String,
    customer_id: String,
    event_type: Option<String>,
    event_timestamp: DateTime<Utc>,
    device_os: Option<String>,
    page_url: Option<String>,
    error_code: Option<String>,
    received_at: DateTime<Utc>,
}

impl From<ActivityLogRow> for ActivityLog {
    fn from(r: ActivityLogRow) -> Self {
        Self {
            log_id: r.log_id,
            customer_id: r.customer_id,
            event_type: r.event_type,
            event_timestamp: r.event_timestamp,
            device_os: r.device_os,
            page_url: r.page_url,
            error_code: r.error_code,
            received_at: r.received_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SupportCaseRow {
    case_id: String,
    customer_id: String,
    opened_at: DateTime<Utc>,
    channel: Option<String>,
    category: Option<String>,
    sentiment_score: Option<f64>,
    transcript: Option<String>,
}

impl From<SupportCaseRow> for SupportCase {
    fn from(r: SupportCaseRow) -> Self {
        Self {
            case_id: r.case_id,
            customer_id: r.customer_id,
            opened_at: r.opened_at,
            channel: r.channel,
            category: r.category,
            sentiment_score: r.sentiment_score,
            transcript: r.transcript,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AggregateRow {
    customer_id: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    txn_count: i64,
    total_spend: f64,
    wire_out_total: f64,
    error_count: i64,
    support_cases: i64,
    avg_sentiment: f64,
    active_days: i64,
    churn_score_bp: i32,
    risk_class: String,
    computed_at: DateTime<Utc>,
}

impl TryFrom<AggregateRow> for AggregateRecord {
    type Error = anyhow::Error;

    fn try_from(r: AggregateRow) -> Result<Self> {
        let risk_class: RiskClass = r.risk_class.parse().map_err(anyhow::Error::msg)?;
        let bp = u32::try_from(r.churn_score_bp)
            .with_context(|| format!("negative churn score for {}", r.customer_id))?;
        Ok(Self {
            entity_id: r.customer_id,
            window_start: r.window_start,
            window_end: r.window_end,
            txn_count: r.txn_count,
            total_spend: r.total_spend,
            wire_out_total: r.wire_out_total,
            error_count: r.error_count,
            support_cases: r.support_cases,
            avg_sentiment: r.avg_sentiment,
            active_days: r.active_days,
            churn_score: RiskScore::from_basis_points(bp),
            risk_class,
            computed_at: r.computed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: Uuid,
    customer_id: String,
    churn_score: f64,
    reason: String,
    generated_content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActionRow> for ActionRecord {
    type Error = anyhow::Error;

    fn try_from(r: ActionRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            entity_id: r.customer_id,
            churn_score: r.churn_score,
            reason: r.reason.parse().map_err(anyhow::Error::msg)?,
            generated_content: r.generated_content,
            created_at: r.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// RawEventSink
// ---------------------------------------------------------------------------

#[async_trait]
impl RawEventSink for PgStore {
    async fn write_transactions(&self, batch: &[Transaction]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO transactions (transaction_ref, account_id, posting_date, transaction_code, \
                 amount, merchant_description, merchant_category_code, channel_id, received_at) ",
            );
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(&t.transaction_ref)
                    .push_bind(&t.account_id)
                    .push_bind(t.posting_date)
                    .push_bind(&t.transaction_code)
                    .push_bind(t.amount)
                    .push_bind(&t.merchant_description)
                    .push_bind(&t.merchant_category_code)
                    .push_bind(&t.channel_id)
                    .push_bind(t.received_at);
            });
            qb.push(" ON CONFLICT (transaction_ref) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_activity_logs(&self, batch: &[ActivityLog]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO activity_logs (log_id, customer_id, event_type, event_timestamp, \
                 device_os, page_url, error_code, received_at) ",
            );
            qb.push_values(chunk, |mut b, l| {
                b.push_bind(&l.log_id)
                    .push_bind(&l.customer_id)
                    .push_bind(&l.event_type)
                    .push_bind(l.event_timestamp)
                    .push_bind(&l.device_os)
                    .push_bind(&l.page_url)
                    .push_bind(&l.error_code)
                    .push_bind(l.received_at);
            });
            qb.push(" ON CONFLICT (log_id) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_registrations(&self, batch: &[CustomerRegistration]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO customers (customer_id, full_name, email, segment, join_date, \
                 risk_profile_score, received_at) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(&c.customer_id)
                    .push_bind(&c.full_name)
                    .push_bind(&c.email)
                    .push_bind(&c.segment)
                    .push_bind(c.join_date)
                    .push_bind(c.risk_profile_score)
                    .push_bind(c.received_at);
            });
            qb.push(" ON CONFLICT (customer_id) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        let links: Vec<(&str, &str)> = batch
            .iter()
            .flat_map(|c| {
                c.account_ids
                    .iter()
                    .map(move |a| (a.as_str(), c.customer_id.as_str()))
            })
            .collect();
        for chunk in links.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO customer_accounts (account_id, customer_id) ");
            qb.push_values(chunk, |mut b, (account_id, customer_id)| {
                b.push_bind(*account_id).push_bind(*customer_id);
            });
            qb.push(" ON CONFLICT (account_id) DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// WindowReader
// ---------------------------------------------------------------------------

#[async_trait]
impl WindowReader for PgStore {
    async fn read_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let transactions = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT transaction_ref, account_id, posting_date, transaction_code, amount,
                   merchant_description, merchant_category_code, channel_id, received_at
            FROM transactions
            WHERE posting_date >= $1 AND posting_date < $2
            ORDER BY transaction_ref
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await?;

        let activity_logs = sqlx::query_as::<_, ActivityLogRow>(
            r#"
            SELECT log_id, customer_id, event_type, event_timestamp, device_os, page_url,
                   error_code, received_at
            FROM activity_logs
            WHERE event_timestamp >= $1 AND event_timestamp < $2
            ORDER BY log_id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await?;

        let support_cases = sqlx::query_as::<_, SupportCaseRow>(
            r#"
            SELECT case_id, customer_id, opened_at, channel, category, sentiment_score, transcript
            FROM support_cases
            WHERE opened_at >= $1 AND opened_at < $2
            ORDER BY case_id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await?;

        let account_links = sqlx::query_as::<_, (String, String)>(
            "SELECT account_id, customer_id FROM customer_accounts ORDER BY account_id",
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WindowSnapshot {
            transactions: transactions.into_iter().map(Into::into).collect(),
            activity_logs: activity_logs.into_iter().map(Into::into).collect(),
            support_cases: support_cases.into_iter().map(Into::into).collect(),
            account_links: account_links
                .into_iter()
                .map(|(account_id, customer_id)| AccountLink {
                    account_id,
                    customer_id,
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// AggregateStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AggregateStore for PgStore {
    async fn load_aggregates(&self) -> Result<Vec<AggregateRecord>> {
        let rows = sqlx::query_as::<_, AggregateRow>(
            r#"
            SELECT customer_id, window_start, window_end, txn_count, total_spend, wire_out_total,
                   error_count, support_cases, avg_sentiment, active_days, churn_score_bp,
                   risk_class, computed_at
            FROM churn_aggregates
            ORDER BY customer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AggregateRecord::try_from).collect()
    }

    async fn replace_aggregates(&self, records: &[AggregateRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM churn_aggregates")
            .execute(&mut *tx)
            .await?;

        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO churn_aggregates (customer_id, window_start, window_end, txn_count, \
                 total_spend, wire_out_total, error_count, support_cases, avg_sentiment, \
                 active_days, churn_score_bp, risk_class, computed_at) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(&r.entity_id)
                    .push_bind(r.window_start)
                    .push_bind(r.window_end)
                    .push_bind(r.txn_count)
                    .push_bind(r.total_spend)
                    .push_bind(r.wire_out_total)
                    .push_bind(r.error_count)
                    .push_bind(r.support_cases)
                    .push_bind(r.avg_sentiment)
                    .push_bind(r.active_days)
                    .push_bind(r.churn_score.basis_points() as i32)
                    .push_bind(r.risk_class.to_string())
                    .push_bind(r.computed_at);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ActionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ActionStore for PgStore {
    async fn latest_action_at(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>,)>(
            "SELECT MAX(created_at) FROM retention_actions WHERE customer_id = $1",
        )
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn record_action(&self, action: &ActionRecord, cooldown_bucket: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO retention_actions
                (id, customer_id, churn_score, reason, generated_content, created_at, cooldown_bucket)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (customer_id, cooldown_bucket) DO NOTHING
            "#,
        )
        .bind(action.id)
        .bind(&action.entity_id)
        .bind(action.churn_score)
        .bind(action.reason.to_string())
        .bind(&action.generated_content)
        .bind(action.created_at)
        .bind(cooldown_bucket)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn actions_for(&self, entity_id: &str) -> Result<Vec<ActionRecord>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT id, customer_id, churn_score, reason, generated_content, created_at
            FROM retention_actions
            WHERE customer_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRecord::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// CycleLock
// ---------------------------------------------------------------------------

#[async_trait]
impl CycleLock for PgStore {
    /// Clears a lock left behind by a killed process, then check-and-creates.
    async fn acquire_cycle_lock(&self, stale_after: Duration) -> Result<bool> {
        sqlx::query(
            "DELETE FROM cycle_locks WHERE name = $1 AND started_at < now() - make_interval(secs => $2)",
        )
        .bind(CYCLE_LOCK_NAME)
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            "INSERT INTO cycle_locks (name, holder) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(CYCLE_LOCK_NAME)
        .bind(self.holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_cycle_lock(&self) -> Result<()> {
        sqlx::query("DELETE FROM cycle_locks WHERE name = $1 AND holder = $2")
            .bind(CYCLE_LOCK_NAME)
            .bind(self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ContextSource
// ---------------------------------------------------------------------------

#[async_trait]
impl ContextSource for PgStore {
    async fn context_for(&self, entity_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT transcript
            FROM support_cases
            WHERE customer_id = $1 AND transcript IS NOT NULL AND btrim(transcript) <> ''
            ORDER BY opened_at DESC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

/// Support cases are written by the support desk integration; this exists for
/// seeding and tests.
pub async fn insert_support_case(pool: &PgPool, case: &SupportCase) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO support_cases
            (case_id, customer_id, opened_at, channel, category, sentiment_score, transcript)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (case_id) DO NOTHING
        "#,
    )
    .bind(&case.case_id)
    .bind(&case.customer_id)
    .bind(case.opened_at)
    .bind(&case.channel)
    .bind(&case.category)
    .bind(case.sentiment_score)
    .bind(&case.transcript)
    .execute(pool)
    .await?;
    Ok(())
}
