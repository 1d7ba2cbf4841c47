use std::fmt;

use churnwatch_common::{ActionRecord, TransitionEvent};

/// Result of one dispatch batch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub dispatched: Vec<ActionRecord>,
    /// Capped, interrupted, failed or timed-out transitions, in the order they were offered.
    pub deferred: Vec<TransitionEvent>,
    pub stats: DispatchStats,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub capped: u64,
    /// Left unattempted because shutdown was requested mid-batch.
    pub interrupted: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Record writes that failed after generation succeeded.
    pub store_failures: u64,
    pub context_failures: u64,
    /// Uniqueness conflicts on `(entity, cooldown_bucket)`. Always a logic defect.
    pub conflicts: u64,
}

impl DispatchStats {
    pub fn deferred(&self) -> u64 {
        self.capped + self.interrupted + self.failed + self.timed_out + self.store_failures
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatch(sent={} capped={} interrupted={} failed={} timed_out={} store_failures={} context_failures={} conflicts={})",
            self.dispatched,
            self.capped,
            self.interrupted,
            self.failed,
            self.timed_out,
            self.store_failures,
            self.context_failures,
            self.conflicts,
        )
    }
}

/// Counters for one recomputation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub entities: u64,
    pub high_risk: u64,
    pub transitions: u64,
    /// Deferred entries carried in from the previous cycle.
    pub deferred_in: u64,
    /// Deferred entries dropped because the entity left the top tier.
    pub deferred_expired: u64,
    pub suppressed: u64,
    pub dedup_failures: u64,
    pub dispatch: DispatchStats,
    /// Entries handed to the next cycle.
    pub deferred_out: u64,
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entities={} high_risk={} transitions={} deferred_in={} deferred_expired={} suppressed={} dedup_failures={} deferred_out={} {}",
            self.entities,
            self.high_risk,
            self.transitions,
            self.deferred_in,
            self.deferred_expired,
            self.suppressed,
            self.dedup_failures,
            self.deferred_out,
            self.dispatch,
        )
    }
}
