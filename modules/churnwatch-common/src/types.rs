use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::scoring::RiskScore;

// =============================================================================
// Raw events (ingested, immutable)
// =============================================================================

/// A ledger posting. Attributed to an entity through its account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_ref: String,
    pub account_id: String,
    pub posting_date: DateTime<Utc>,
    pub transaction_code: String,
    pub amount: f64,
    pub merchant_description: Option<String>,
    pub merchant_category_code: Option<String>,
    pub channel_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_wire_out(&self) -> bool {
        self.transaction_code == "WIRE_OUT"
    }
}

/// An app activity log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub log_id: String,
    pub customer_id: String,
    pub event_type: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub device_os: Option<String>,
    pub page_url: Option<String>,
    pub error_code: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A new customer. `account_ids` links ledger accounts to the customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRegistration {
    pub customer_id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub segment: Option<String>,
    pub join_date: Option<NaiveDate>,
    pub risk_profile_score: Option<f64>,
    pub account_ids: Vec<String>,
    pub received_at: DateTime<Utc>,
}

/// One validated, typed event as it leaves the router.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Transaction(Transaction),
    ActivityLog(ActivityLog),
    Registration(CustomerRegistration),
}

impl RawEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Transaction(_) => EventKind::Transaction,
            Self::ActivityLog(_) => EventKind::ActivityLog,
            Self::Registration(_) => EventKind::Registration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transaction,
    ActivityLog,
    Registration,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction => write!(f, "transaction"),
            Self::ActivityLog => write!(f, "activity_log"),
            Self::Registration => write!(f, "registration"),
        }
    }
}

/// A support interaction. Written outside the pipeline; read for scoring and context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportCase {
    pub case_id: String,
    pub customer_id: String,
    pub opened_at: DateTime<Utc>,
    pub channel: Option<String>,
    pub category: Option<String>,
    pub sentiment_score: Option<f64>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLink {
    pub account_id: String,
    pub customer_id: String,
}

/// Point-in-time read of everything inside one aggregation window.
#[derive(Debug, Clone, Default)]
pub struct WindowSnapshot {
    pub transactions: Vec<Transaction>,
    pub activity_logs: Vec<ActivityLog>,
    pub support_cases: Vec<SupportCase>,
    pub account_links: Vec<AccountLink>,
}

// =============================================================================
// Aggregates
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

impl RiskClass {
    pub fn is_top_tier(self) -> bool {
        self == Self::High
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

impl FromStr for RiskClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!("unknown risk class: {other}")),
        }
    }
}

/// One entity's rolling metrics for one recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub entity_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub txn_count: i64,
    pub total_spend: f64,
    pub wire_out_total: f64,
    pub error_count: i64,
    pub support_cases: i64,
    pub avg_sentiment: f64,
    pub active_days: i64,
    pub churn_score: RiskScore,
    pub risk_class: RiskClass,
    pub computed_at: DateTime<Utc>,
}

// =============================================================================
// Transitions and actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    #[serde(rename = "CRITICAL_RISK_DETECTED")]
    CriticalRiskDetected,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CriticalRiskDetected => write!(f, "CRITICAL_RISK_DETECTED"),
        }
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRITICAL_RISK_DETECTED" => Ok(Self::CriticalRiskDetected),
            other => Err(format!("unknown reason code: {other}")),
        }
    }
}

/// An entity entering the top risk tier. Ephemeral; consumed by the dedup gate.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub entity_id: String,
    pub churn_score: RiskScore,
    pub risk_class: RiskClass,
    pub reason: ReasonCode,
    pub observed_at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn from_record(record: &AggregateRecord, observed_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: record.entity_id.clone(),
            churn_score: record.churn_score,
            risk_class: record.risk_class,
            reason: ReasonCode::CriticalRiskDetected,
            observed_at,
        }
    }
}

/// A dispatched retention action. Only written once generation succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub entity_id: String,
    pub churn_score: f64,
    pub reason: ReasonCode,
    pub generated_content: String,
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(
        transition: &TransitionEvent,
        generated_content: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: transition.entity_id.clone(),
            churn_score: transition.churn_score.as_f64(),
            reason: transition.reason,
            generated_content,
            created_at,
        }
    }
}
