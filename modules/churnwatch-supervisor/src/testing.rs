// Test doubles for the supervisor.
//
// - MockGenerator (TextGenerator): per-entity scripted failures and delays,
//   records every request it sees.
// - Fixture helpers that write raw events straight into a MemoryStore so an
//   entity lands in a chosen risk class on the next recomputation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use churnwatch_common::{ActivityLog, SupportCase, Transaction};
use churnwatch_store::{MemoryStore, RawEventSink};

use crate::generator::{GenerationRequest, TextGenerator};

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    requests: Vec<GenerationRequest>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
}

/// Echoes a fixed email per entity. Clones share state.
#[derive(Clone, Default)]
pub struct MockGenerator {
    state: Arc<Mutex<MockState>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every call for `entity_id` errors until `recover` is called.
    pub fn fail_for(&self, entity_id: &str) {
        self.state().failing.insert(entity_id.to_string());
    }

    /// Every call for `entity_id` sleeps before answering.
    pub fn delay_for(&self, entity_id: &str, delay: Duration) {
        self.state().delays.insert(entity_id.to_string(), delay);
    }

    pub fn recover(&self, entity_id: &str) {
        let mut state = self.state();
        state.failing.remove(entity_id);
        state.delays.remove(entity_id);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.state().requests.clone()
    }

    pub fn calls_for(&self, entity_id: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .count()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let (failing, delay) = {
            let mut state = self.state();
            state.requests.push(request.clone());
            (
                state.failing.contains(&request.entity_id),
                state.delays.get(&request.entity_id).copied(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            bail!("generation service unavailable for {}", request.entity_id);
        }
        Ok(format!(
            "Dear customer {}, please accept a $50 statement credit. The Data Team",
            request.entity_id
        ))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Raw events that score 1.00 for `entity_id`: large wire-out, three unhappy
/// support cases, six errors over three days.
pub async fn seed_critical(store: &MemoryStore, entity_id: &str, at: DateTime<Utc>) -> Result<()> {
    let account = format!("ACC-{entity_id}");
    store.link_account(&account, entity_id);

    let transactions = vec![Transaction {
        transaction_ref: format!("WIRE-{entity_id}-{}", at.timestamp()),
        account_id: account,
        posting_date: at,
        transaction_code: "WIRE_OUT".to_string(),
        amount: 9_000.0,
        merchant_description: None,
        merchant_category_code: None,
        channel_id: None,
        received_at: at,
    }];
    store.write_transactions(&transactions).await?;

    let logs: Vec<ActivityLog> = (0..6)
        .map(|i| ActivityLog {
            log_id: format!("ERR-{entity_id}-{}-{i}", at.timestamp()),
            customer_id: entity_id.to_string(),
            event_type: Some("ERROR".to_string()),
            event_timestamp: at - chrono::Duration::days(i % 3),
            device_os: Some("iOS".to_string()),
            page_url: None,
            error_code: Some("ERR_TIMEOUT".to_string()),
            received_at: at,
        })
        .collect();
    store.write_activity_logs(&logs).await?;

    for i in 0..3 {
        store.insert_support_case(SupportCase {
            case_id: format!("CASE-{entity_id}-{}-{i}", at.timestamp()),
            customer_id: entity_id.to_string(),
            opened_at: at - chrono::Duration::hours(i),
            channel: Some("CHAT".to_string()),
            category: Some("COMPLAINT".to_string()),
            sentiment_score: Some(0.1),
            transcript: Some(format!("Complaint number {i}")),
        });
    }
    Ok(())
}

/// Activity on ten distinct days with no errors. Scores 0.00.
pub async fn seed_quiet(store: &MemoryStore, entity_id: &str, at: DateTime<Utc>) -> Result<()> {
    let logs: Vec<ActivityLog> = (0..10)
        .map(|i| ActivityLog {
            log_id: format!("LOGIN-{entity_id}-{}-{i}", at.timestamp()),
            customer_id: entity_id.to_string(),
            event_type: Some("LOGIN".to_string()),
            event_timestamp: at - chrono::Duration::days(i),
            device_os: Some("Android".to_string()),
            page_url: None,
            error_code: None,
            received_at: at,
        })
        .collect();
    store.write_activity_logs(&logs).await?;
    Ok(())
}
