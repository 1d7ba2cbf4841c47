//! Event router: one decoded message in, one typed event (or a counted
//! rejection) out. Never blocks and never touches a buffer.
//!
//! Envelope shape: `{"type": "...", "payload": {...}}`. The discriminator is
//! also accepted as `event_type`, which is what the upstream producer emits.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use churnwatch_common::text::{clamp_chars, clamp_opt};
use churnwatch_common::{ActivityLog, CustomerRegistration, RawEvent, Transaction};

// Column widths of the raw tables.
const TRANSACTION_CODE_MAX: usize = 50;
const MERCHANT_DESCRIPTION_MAX: usize = 255;
const MERCHANT_CATEGORY_MAX: usize = 10;
const CHANNEL_ID_MAX: usize = 20;
const LOG_EVENT_TYPE_MAX: usize = 50;
const DEVICE_OS_MAX: usize = 20;
const PAGE_URL_MAX: usize = 255;
const ERROR_CODE_MAX: usize = 20;
const FULL_NAME_MAX: usize = 100;
const EMAIL_MAX: usize = 100;
const SEGMENT_MAX: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MalformedReason {
    InvalidJson,
    MissingDiscriminator,
    UnknownDiscriminator,
    MissingPayload,
    InvalidPayload,
    MissingField,
    InvalidTimestamp,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid_json"),
            Self::MissingDiscriminator => write!(f, "missing_discriminator"),
            Self::UnknownDiscriminator => write!(f, "unknown_discriminator"),
            Self::MissingPayload => write!(f, "missing_payload"),
            Self::InvalidPayload => write!(f, "invalid_payload"),
            Self::MissingField => write!(f, "missing_field"),
            Self::InvalidTimestamp => write!(f, "invalid_timestamp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct Malformed {
    pub reason: MalformedReason,
    pub detail: String,
}

impl Malformed {
    fn new(reason: MalformedReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Deserialize)]
struct TransactionPayload {
    transaction_ref: Option<String>,
    account_id: Option<String>,
    posting_date: Option<String>,
    transaction_code: Option<String>,
    amount: Option<f64>,
    merchant_description: Option<String>,
    merchant_category_code: Option<String>,
    channel_id: Option<String>,
}

#[derive(Deserialize)]
struct ActivityLogPayload {
    log_id: Option<String>,
    customer_id: Option<String>,
    event_type: Option<String>,
    event_timestamp: Option<String>,
    device_os: Option<String>,
    page_url: Option<String>,
    error_code: Option<String>,
}

#[derive(Deserialize)]
struct RegistrationPayload {
    customer_id: Option<String>,
    full_name: Option<String>,
    email: Option<String>,
    segment: Option<String>,
    join_date: Option<String>,
    risk_profile_score: Option<f64>,
    #[serde(default)]
    account_ids: Vec<String>,
}

/// Stateless classifier for inbound messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventRouter;

impl EventRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn route(&self, bytes: &[u8], received_at: DateTime<Utc>) -> Result<RawEvent, Malformed> {
        let envelope: Value = serde_json::from_slice(bytes)
            .map_err(|e| Malformed::new(MalformedReason::InvalidJson, e.to_string()))?;
        let object = envelope
            .as_object()
            .ok_or_else(|| Malformed::new(MalformedReason::InvalidJson, "envelope is not an object"))?;

        let discriminator = object
            .get("type")
            .or_else(|| object.get("event_type"))
            .and_then(Value::as_str)
            .ok_or_else(|| Malformed::new(MalformedReason::MissingDiscriminator, "no type field"))?;

        let payload = match object.get("payload") {
            Some(p @ Value::Object(_)) => p.clone(),
            Some(_) => {
                return Err(Malformed::new(
                    MalformedReason::InvalidPayload,
                    "payload is not an object",
                ))
            }
            None => return Err(Malformed::new(MalformedReason::MissingPayload, "no payload")),
        };

        match discriminator {
            "TXN" | "behavioral-event" => route_transaction(payload, received_at),
            "LOG" | "log-event" => route_activity_log(payload, received_at),
            "USER" | "entity-registration" => route_registration(payload, received_at),
            other => Err(Malformed::new(
                MalformedReason::UnknownDiscriminator,
                format!("unknown type {other:?}"),
            )),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, Malformed> {
    serde_json::from_value(payload)
        .map_err(|e| Malformed::new(MalformedReason::InvalidPayload, e.to_string()))
}

fn required(value: Option<String>, field: &str) -> Result<String, Malformed> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Malformed::new(MalformedReason::MissingField, field))
}

fn required_timestamp(value: Option<String>, field: &str) -> Result<DateTime<Utc>, Malformed> {
    let raw = required(value, field)?;
    parse_timestamp(&raw).ok_or_else(|| {
        Malformed::new(MalformedReason::InvalidTimestamp, format!("{field}: {raw:?}"))
    })
}

/// RFC 3339, or naive ISO-8601 taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn route_transaction(payload: Value, received_at: DateTime<Utc>) -> Result<RawEvent, Malformed> {
    let p: TransactionPayload = decode(payload)?;
    let transaction_code = required(p.transaction_code, "transaction_code")?;
    let amount = p
        .amount
        .ok_or_else(|| Malformed::new(MalformedReason::MissingField, "amount"))?;

    Ok(RawEvent::Transaction(Transaction {
        transaction_ref: required(p.transaction_ref, "transaction_ref")?,
        account_id: required(p.account_id, "account_id")?,
        posting_date: required_timestamp(p.posting_date, "posting_date")?,
        transaction_code: clamp_chars(&transaction_code, TRANSACTION_CODE_MAX).to_string(),
        amount,
        merchant_description: clamp_opt(p.merchant_description, MERCHANT_DESCRIPTION_MAX),
        merchant_category_code: clamp_opt(p.merchant_category_code, MERCHANT_CATEGORY_MAX),
        channel_id: clamp_opt(p.channel_id, CHANNEL_ID_MAX),
        received_at,
    }))
}

fn route_activity_log(payload: Value, received_at: DateTime<Utc>) -> Result<RawEvent, Malformed> {
    let p: ActivityLogPayload = decode(payload)?;

    Ok(RawEvent::ActivityLog(ActivityLog {
        log_id: required(p.log_id, "log_id")?,
        customer_id: required(p.customer_id, "customer_id")?,
        event_type: clamp_opt(p.event_type, LOG_EVENT_TYPE_MAX),
        event_timestamp: required_timestamp(p.event_timestamp, "event_timestamp")?,
        device_os: clamp_opt(p.device_os, DEVICE_OS_MAX),
        page_url: clamp_opt(p.page_url, PAGE_URL_MAX),
        error_code: clamp_opt(p.error_code, ERROR_CODE_MAX),
        received_at,
    }))
}

fn route_registration(payload: Value, received_at: DateTime<Utc>) -> Result<RawEvent, Malformed> {
    let p: RegistrationPayload = decode(payload)?;

    // An unparseable join date is dropped rather than rejecting the customer.
    let join_date = p
        .join_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());

    let mut account_ids: Vec<String> = p
        .account_ids
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    account_ids.sort();
    account_ids.dedup();

    Ok(RawEvent::Registration(CustomerRegistration {
        customer_id: required(p.customer_id, "customer_id")?,
        full_name: clamp_opt(p.full_name, FULL_NAME_MAX),
        email: clamp_opt(p.email, EMAIL_MAX),
        segment: clamp_opt(p.segment, SEGMENT_MAX),
        join_date,
        risk_profile_score: p.risk_profile_score,
        account_ids,
        received_at,
    }))
}
