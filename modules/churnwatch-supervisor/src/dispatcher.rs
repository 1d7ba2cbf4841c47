//! Rate-limited retention action dispatch.
//!
//! For each admitted transition, up to the per-cycle cap: read context, call
//! the generator under a timeout, then persist the action. Nothing is written
//! unless generation produced content, so a failure leaves the entity
//! unactioned and eligible next cycle.
//!
//! Shutdown is checked between candidates: the call in flight finishes and
//! everything after it is handed back as deferred.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use churnwatch_common::{ActionRecord, ActionsConfig, ChurnWatchError, TransitionEvent};
use churnwatch_store::{ActionStore, ContextSource};

use crate::dedup::DedupGate;
use crate::generator::{GenerationRequest, TextGenerator};
use crate::types::{DispatchOutcome, DispatchStats};

pub struct ActionDispatcher<G> {
    generator: G,
    gate: DedupGate,
    max_per_cycle: u64,
    timeout: Duration,
}

enum Attempt {
    Sent(ActionRecord),
    Deferred,
    Conflict,
}

impl<G: TextGenerator> ActionDispatcher<G> {
    pub fn new(generator: G, config: &ActionsConfig) -> Self {
        Self {
            generator,
            gate: DedupGate::new(config.cooldown),
            max_per_cycle: config.max_per_cycle,
            timeout: config.generation_timeout,
        }
    }

    pub fn gate(&self) -> &DedupGate {
        &self.gate
    }

    /// Candidates are handled in order. Those beyond the cap, or left over
    /// once `shutdown` fires, are returned as deferred without a generation
    /// call.
    pub async fn dispatch<S>(
        &self,
        store: &S,
        candidates: Vec<TransitionEvent>,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> DispatchOutcome
    where
        S: ActionStore + ContextSource,
    {
        let mut remaining = self.max_per_cycle;
        let mut outcome = DispatchOutcome::default();

        for transition in candidates {
            if shutdown.is_cancelled() {
                outcome.stats.interrupted += 1;
                outcome.deferred.push(transition);
                continue;
            }
            // A slot is spent on every attempt, successful or not.
            if remaining == 0 {
                outcome.stats.capped += 1;
                outcome.deferred.push(transition);
                continue;
            }
            remaining -= 1;

            match self.attempt(store, &transition, now, &mut outcome.stats).await {
                Attempt::Sent(action) => {
                    outcome.stats.dispatched += 1;
                    outcome.dispatched.push(action);
                }
                Attempt::Deferred => outcome.deferred.push(transition),
                Attempt::Conflict => outcome.stats.conflicts += 1,
            }
        }

        if outcome.stats.capped > 0 {
            info!(
                capped = outcome.stats.capped,
                max_per_cycle = self.max_per_cycle,
                "Dispatch cap reached, deferring remainder"
            );
        }
        if outcome.stats.interrupted > 0 {
            info!(
                interrupted = outcome.stats.interrupted,
                "Shutdown requested, deferring remainder"
            );
        }
        outcome
    }

    async fn attempt<S>(
        &self,
        store: &S,
        transition: &TransitionEvent,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) -> Attempt
    where
        S: ActionStore + ContextSource,
    {
        let entity_id = transition.entity_id.as_str();

        let context = match store.context_for(entity_id).await {
            Ok(snippets) => snippets.join(". "),
            Err(e) => {
                warn!(entity_id, error = %e, "Context read failed, generating without context");
                stats.context_failures += 1;
                String::new()
            }
        };

        let request = GenerationRequest {
            entity_id: entity_id.to_string(),
            churn_score: transition.churn_score,
            reason: transition.reason,
            context,
        };

        let content = match tokio::time::timeout(self.timeout, self.generator.generate(&request)).await {
            Ok(Ok(content)) if !content.trim().is_empty() => content,
            Ok(Ok(_)) => {
                warn!(entity_id, "Generator returned empty content, deferring");
                stats.failed += 1;
                return Attempt::Deferred;
            }
            Ok(Err(e)) => {
                warn!(entity_id, error = %e, "Generation failed, deferring");
                stats.failed += 1;
                return Attempt::Deferred;
            }
            Err(_) => {
                let e = ChurnWatchError::GenerationTimeout(self.timeout);
                warn!(entity_id, error = %e, "Deferring");
                stats.timed_out += 1;
                return Attempt::Deferred;
            }
        };

        let action = ActionRecord::new(transition, content, now);
        match store.record_action(&action, self.gate.cooldown_bucket(now)).await {
            Ok(true) => {
                info!(entity_id, churn_score = %transition.churn_score, "Retention action recorded");
                Attempt::Sent(action)
            }
            Ok(false) => {
                let e = ChurnWatchError::InvariantViolation(format!(
                    "duplicate action for {entity_id} inside cooldown bucket"
                ));
                error!(entity_id, error = %e, "Action slot already taken");
                Attempt::Conflict
            }
            Err(e) => {
                warn!(entity_id, error = %e, "Failed to record action, deferring");
                stats.store_failures += 1;
                Attempt::Deferred
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use churnwatch_common::{ReasonCode, RiskClass, RiskScore};
    use churnwatch_store::MemoryStore;

    use crate::testing::MockGenerator;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn transition(entity: &str) -> TransitionEvent {
        TransitionEvent {
            entity_id: entity.to_string(),
            churn_score: RiskScore::MAX,
            risk_class: RiskClass::High,
            reason: ReasonCode::CriticalRiskDetected,
            observed_at: now(),
        }
    }

    fn config(max_per_cycle: u64) -> ActionsConfig {
        ActionsConfig {
            max_per_cycle,
            ..ActionsConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_attempts_still_spend_the_cap() {
        let generator = MockGenerator::new();
        generator.fail_for("A");
        let dispatcher = ActionDispatcher::new(generator.clone(), &config(1));
        let store = MemoryStore::new();

        let outcome = dispatcher
            .dispatch(&store, vec![transition("A"), transition("B")], now(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(outcome.stats.capped, 1);
        let deferred: Vec<&str> = outcome.deferred.iter().map(|t| t.entity_id.as_str()).collect();
        assert_eq!(deferred, vec!["A", "B"]);
        assert_eq!(generator.calls_for("B"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_the_call_in_flight_finish_and_defers_the_rest() {
        let generator = MockGenerator::new();
        for id in ["A", "B", "C"] {
            generator.delay_for(id, Duration::from_millis(500));
        }
        let dispatcher = ActionDispatcher::new(generator.clone(), &config(10));
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        };
        let batch = vec![transition("A"), transition("B"), transition("C")];
        let (outcome, ()) = tokio::join!(dispatcher.dispatch(&store, batch, now(), &shutdown), cancel);

        assert_eq!(generator.requests().len(), 1);
        assert_eq!(outcome.stats.dispatched, 1);
        assert_eq!(outcome.dispatched[0].entity_id, "A");
        assert_eq!(outcome.stats.interrupted, 2);
        assert_eq!(outcome.stats.deferred(), 2);
        let deferred: Vec<&str> = outcome.deferred.iter().map(|t| t.entity_id.as_str()).collect();
        assert_eq!(deferred, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn zero_cap_defers_everything_without_calls() {
        let generator = MockGenerator::new();
        let dispatcher = ActionDispatcher::new(generator.clone(), &config(0));
        let store = MemoryStore::new();

        let outcome = dispatcher
            .dispatch(&store, vec![transition("A"), transition("B")], now(), &CancellationToken::new())
            .await;

        assert!(outcome.dispatched.is_empty());
        assert_eq!(outcome.deferred.len(), 2);
        assert_eq!(outcome.stats.capped, 2);
        assert_eq!(outcome.stats.deferred(), 2);
        assert!(generator.requests().is_empty());
    }

    #[tokio::test]
    async fn taken_cooldown_slot_is_a_conflict_not_a_retry() {
        let generator = MockGenerator::new();
        let dispatcher = ActionDispatcher::new(generator.clone(), &config(10));
        let store = MemoryStore::new();

        let earlier = ActionRecord::new(&transition("A"), "first".to_string(), now());
        let bucket = dispatcher.gate().cooldown_bucket(now());
        assert!(store.record_action(&earlier, bucket).await.unwrap());

        let outcome = dispatcher
            .dispatch(&store, vec![transition("A")], now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.stats.conflicts, 1);
        assert!(outcome.deferred.is_empty());
        assert_eq!(store.all_actions().len(), 1);
    }

    #[tokio::test]
    async fn recorded_action_carries_generated_content() {
        let generator = MockGenerator::new();
        let dispatcher = ActionDispatcher::new(generator, &config(10));
        let store = MemoryStore::new();

        let outcome = dispatcher
            .dispatch(&store, vec![transition("A")], now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.dispatched.len(), 1);
        let action = &outcome.dispatched[0];
        assert_eq!(action.entity_id, "A");
        assert_eq!(action.reason, ReasonCode::CriticalRiskDetected);
        assert_eq!(action.created_at, now());
        assert!(action.generated_content.contains("statement credit"));
        assert_eq!(store.all_actions(), vec![action.clone()]);
    }
}
