use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use churnwatch_common::TransitionEvent;
use churnwatch_store::ActionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Suppressed { last_action_at: DateTime<Utc> },
}

/// Suppresses a transition when the entity was actioned within the cooldown.
///
/// The read here is advisory. The storage layer's uniqueness on
/// `(entity, cooldown_bucket)` is what actually closes the check-then-act
/// race between concurrent dispatchers.
#[derive(Debug, Clone)]
pub struct DedupGate {
    cooldown: Duration,
}

impl DedupGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub async fn admit<S: ActionStore + ?Sized>(
        &self,
        store: &S,
        transition: &TransitionEvent,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let last = store
            .latest_action_at(&transition.entity_id)
            .await
            .with_context(|| format!("Failed to read last action for {}", transition.entity_id))?;

        let Some(last_action_at) = last else {
            return Ok(Admission::Admit);
        };

        // A last action in the future (clock skew) counts as inside the cooldown.
        let within = match (now - last_action_at).to_std() {
            Ok(elapsed) => elapsed < self.cooldown,
            Err(_) => true,
        };

        if within {
            debug!(entity_id = %transition.entity_id, %last_action_at, "Suppressed by cooldown");
            Ok(Admission::Suppressed { last_action_at })
        } else {
            Ok(Admission::Admit)
        }
    }

    /// Fixed bucket index of `at`. Two actions a full cooldown apart never
    /// share a bucket.
    pub fn cooldown_bucket(&self, at: DateTime<Utc>) -> i64 {
        let width = self.cooldown.as_secs().max(1) as i64;
        at.timestamp().div_euclid(width)
    }
}
