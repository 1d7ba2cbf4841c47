use std::collections::HashMap;

use chrono::{DateTime, Utc};

use churnwatch_common::{AggregateRecord, RiskClass, TransitionEvent};

/// Edge-triggered detection of entities entering the top risk tier.
///
/// Holds each entity's class from the previous recomputation. An entity that
/// stays in the top tier emits nothing; leaving it (by dropping a class or
/// falling out of the window entirely) re-arms the edge.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    previous: HashMap<String, RiskClass>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime from persisted aggregates so a restart does not re-fire every
    /// entity already in the top tier.
    pub fn seed(&mut self, records: &[AggregateRecord]) {
        self.previous = records
            .iter()
            .map(|r| (r.entity_id.clone(), r.risk_class))
            .collect();
    }

    /// Compare against the last observation and remember `current`.
    /// Transitions come back in the order of `current`.
    pub fn observe(
        &mut self,
        current: &[AggregateRecord],
        observed_at: DateTime<Utc>,
    ) -> Vec<TransitionEvent> {
        let transitions = current
            .iter()
            .filter(|r| r.risk_class.is_top_tier())
            .filter(|r| {
                !self
                    .previous
                    .get(&r.entity_id)
                    .is_some_and(|prev| prev.is_top_tier())
            })
            .map(|r| TransitionEvent::from_record(r, observed_at))
            .collect();

        self.previous = current
            .iter()
            .map(|r| (r.entity_id.clone(), r.risk_class))
            .collect();

        transitions
    }

    pub fn class_of(&self, entity_id: &str) -> Option<RiskClass> {
        self.previous.get(entity_id).copied()
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }
}
