use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use churnwatch_common::{AggregateRecord, PipelineConfig, TransitionEvent};
use churnwatch_store::CycleStore;

use crate::aggregator::WindowedAggregator;
use crate::dedup::Admission;
use crate::detector::ChangeDetector;
use crate::dispatcher::ActionDispatcher;
use crate::generator::TextGenerator;
use crate::types::CycleStats;

/// State that must survive between cycles and must never be touched by two
/// cycles at once.
#[derive(Default)]
struct CycleState {
    detector: ChangeDetector,
    /// Transitions that were capped, failed or interrupted, retried first
    /// next cycle. Rebuilt from storage after a restart.
    deferred: Vec<TransitionEvent>,
    seeded: bool,
}

/// Periodic recomputation: aggregate, detect, gate, dispatch.
pub struct Supervisor<S, G> {
    store: S,
    aggregator: WindowedAggregator,
    dispatcher: ActionDispatcher<G>,
    lock_stale_after: Duration,
    state: Mutex<CycleState>,
}

impl<S, G> Supervisor<S, G>
where
    S: CycleStore,
    G: TextGenerator,
{
    pub fn new(store: S, generator: G, config: &PipelineConfig) -> Self {
        Self {
            store,
            aggregator: WindowedAggregator::new(config.scoring.window, config.scoring.rules.clone()),
            dispatcher: ActionDispatcher::new(generator, &config.actions),
            lock_stale_after: config.actions.lock_stale_after,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Entities waiting for a retry.
    pub async fn deferred(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .deferred
            .iter()
            .map(|t| t.entity_id.clone())
            .collect()
    }

    /// Run one cycle. Returns `None` when another cycle is in flight, in this
    /// process or elsewhere.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<Option<CycleStats>> {
        self.run_cycle_until(now, &CancellationToken::new()).await
    }

    /// Like [`Self::run_cycle`], but stops dispatching once `shutdown` fires.
    /// The generation call in flight completes; the rest is deferred.
    pub async fn run_cycle_until(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Option<CycleStats>> {
        let Ok(mut state) = self.state.try_lock() else {
            warn!("Previous cycle still running, skipping");
            return Ok(None);
        };

        if !self.store.acquire_cycle_lock(self.lock_stale_after).await? {
            warn!("Another supervisor holds the cycle lock, skipping");
            return Ok(None);
        }

        let result = self.run_inner(&mut state, now, shutdown).await;

        // Always release lock
        if let Err(e) = self.store.release_cycle_lock().await {
            warn!(error = %e, "Failed to release cycle lock");
        }

        result.map(Some)
    }

    async fn run_inner(
        &self,
        state: &mut CycleState,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        if !state.seeded {
            let previous = self.store.load_aggregates().await?;
            state.detector.seed(&previous);
            state.deferred = self.unactioned(&previous, now).await;
            info!(
                entities = previous.len(),
                deferred = state.deferred.len(),
                "Seeded change detector from last materialization"
            );
            state.seeded = true;
        }

        // Phase 1: recompute the window
        let records = self.aggregator.recompute(&self.store, now).await?;
        stats.entities = records.len() as u64;
        stats.high_risk = records.iter().filter(|r| r.risk_class.is_top_tier()).count() as u64;

        // Phase 2: edge detection
        let transitions = state.detector.observe(&records, now);
        stats.transitions = transitions.len() as u64;

        // Phase 3: deferred first, then fresh transitions
        let carried = std::mem::take(&mut state.deferred);
        stats.deferred_in = carried.len() as u64;
        let candidates = merge_candidates(carried, transitions, &records, now, &mut stats);

        // Phase 4: cooldown gate
        let mut admitted = Vec::with_capacity(candidates.len());
        let mut retry_next = Vec::new();
        for transition in candidates {
            match self.dispatcher.gate().admit(&self.store, &transition, now).await {
                Ok(Admission::Admit) => admitted.push(transition),
                Ok(Admission::Suppressed { .. }) => stats.suppressed += 1,
                Err(e) => {
                    warn!(entity_id = %transition.entity_id, error = %e, "Dedup check failed, deferring");
                    stats.dedup_failures += 1;
                    retry_next.push(transition);
                }
            }
        }

        // Phase 5: dispatch
        let outcome = self.dispatcher.dispatch(&self.store, admitted, now, shutdown).await;
        if outcome.stats.conflicts > 0 {
            error!(conflicts = outcome.stats.conflicts, "Cooldown uniqueness violated");
        }
        stats.dispatch = outcome.stats;

        let mut deferred = outcome.deferred;
        deferred.extend(retry_next);
        stats.deferred_out = deferred.len() as u64;
        state.deferred = deferred;

        info!("Cycle complete. {stats}");
        Ok(stats)
    }

    /// Top-tier entities from the last materialization with no action inside
    /// the cooldown. The seeded detector will never report an edge for them,
    /// so they go straight onto the deferred list. A failed dedup read keeps
    /// the entity; the gate runs again before dispatch.
    async fn unactioned(&self, previous: &[AggregateRecord], now: DateTime<Utc>) -> Vec<TransitionEvent> {
        let mut pending = Vec::new();
        for record in previous.iter().filter(|r| r.risk_class.is_top_tier()) {
            let transition = TransitionEvent::from_record(record, now);
            match self.dispatcher.gate().admit(&self.store, &transition, now).await {
                Ok(Admission::Admit) => pending.push(transition),
                Ok(Admission::Suppressed { .. }) => {}
                Err(e) => {
                    warn!(entity_id = %record.entity_id, error = %e, "Dedup check failed while seeding, keeping entity");
                    pending.push(transition);
                }
            }
        }
        pending
    }

    /// Run cycles on `cadence` until `shutdown` fires. A cycle that overruns
    /// its slot makes the next tick skip rather than pile up.
    pub async fn run(&self, cadence: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(cadence_secs = cadence.as_secs(), "Supervisor loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle_until(Utc::now(), &shutdown).await {
                        error!(error = %format!("{e:#}"), "Cycle failed");
                    }
                }
            }
        }
        info!("Supervisor loop stopped");
    }
}

/// Deferred entries still in the top tier go first, refreshed from the
/// current aggregates, followed by fresh transitions for entities not
/// already queued.
fn merge_candidates(
    carried: Vec<TransitionEvent>,
    transitions: Vec<TransitionEvent>,
    records: &[AggregateRecord],
    now: DateTime<Utc>,
    stats: &mut CycleStats,
) -> Vec<TransitionEvent> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(carried.len() + transitions.len());

    for old in carried {
        let current = records
            .iter()
            .find(|r| r.entity_id == old.entity_id && r.risk_class.is_top_tier());
        match current {
            Some(record) if seen.insert(record.entity_id.clone()) => {
                candidates.push(TransitionEvent::from_record(record, now));
            }
            Some(_) => {}
            None => stats.deferred_expired += 1,
        }
    }

    for transition in transitions {
        if seen.insert(transition.entity_id.clone()) {
            candidates.push(transition);
        }
    }
    candidates
}
