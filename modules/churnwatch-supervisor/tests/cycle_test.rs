//! Full recomputation cycles against the in-memory store and a scripted
//! generator. Each test drives `run_cycle` with explicit timestamps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use churnwatch_common::PipelineConfig;
use churnwatch_store::{ActionStore, AggregateStore, CycleLock, MemoryStore};
use churnwatch_supervisor::testing::{seed_critical, seed_quiet, MockGenerator};
use churnwatch_supervisor::{CycleStats, Supervisor};

fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

fn day(d: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::days(d)
}

/// A three-day window keeps every seeded event in view for a cycle one hour
/// later and lets it all age out four days after seeding.
fn config(max_per_cycle: u64) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scoring.window = Duration::from_secs(3 * 24 * 3600);
    config.actions.cooldown = Duration::from_secs(7 * 24 * 3600);
    config.actions.max_per_cycle = max_per_cycle;
    config.actions.generation_timeout = Duration::from_secs(1);
    config
}

fn supervisor(
    store: &MemoryStore,
    generator: &MockGenerator,
    max_per_cycle: u64,
) -> Supervisor<MemoryStore, MockGenerator> {
    Supervisor::new(store.clone(), generator.clone(), &config(max_per_cycle))
}

async fn cycle(sup: &Supervisor<MemoryStore, MockGenerator>, at: DateTime<Utc>) -> CycleStats {
    sup.run_cycle(at).await.unwrap().expect("cycle should not be skipped")
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn critical_entity_gets_exactly_one_action() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    seed_quiet(&store, "C2", day(0)).await.unwrap();

    let stats = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(stats.entities, 2);
    assert_eq!(stats.high_risk, 1);
    assert_eq!(stats.transitions, 1);
    assert_eq!(stats.dispatch.dispatched, 1);

    let actions = store.actions_for("C1").await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].churn_score, 1.0);
    assert_eq!(actions[0].created_at, day(0) + hours(1));
    assert!(actions[0].generated_content.contains("C1"));
    assert!(store.actions_for("C2").await.unwrap().is_empty());

    // Still HIGH on the following cycles: no new edge, no new action.
    for h in 2..5 {
        let stats = cycle(&sup, day(0) + hours(h)).await;
        assert_eq!(stats.transitions, 0);
        assert_eq!(stats.dispatch.dispatched, 0);
    }
    assert_eq!(generator.calls_for("C1"), 1);
    assert_eq!(store.all_actions().len(), 1);
}

#[tokio::test]
async fn aggregates_are_materialized_each_cycle() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    cycle(&sup, day(0) + hours(1)).await;

    let aggregates = store.load_aggregates().await.unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].entity_id, "C1");
    assert_eq!(aggregates[0].wire_out_total, 9_000.0);
    assert_eq!(aggregates[0].error_count, 6);
    assert_eq!(aggregates[0].active_days, 3);
    assert_eq!(aggregates[0].window_end, day(0) + hours(1));
}

#[tokio::test]
async fn generator_sees_support_context_newest_first() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    cycle(&sup, day(0) + hours(1)).await;

    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].context,
        "Complaint number 0. Complaint number 1. Complaint number 2"
    );
    assert_eq!(requests[0].reason.to_string(), "CRITICAL_RISK_DETECTED");
}

// =========================================================================
// Cap and deferral
// =========================================================================

#[tokio::test]
async fn cap_defers_the_excess_to_later_cycles() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 2);

    for id in ["C1", "C2", "C3", "C4", "C5"] {
        seed_critical(&store, id, day(0)).await.unwrap();
    }

    let first = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(first.transitions, 5);
    assert_eq!(first.dispatch.dispatched, 2);
    assert_eq!(first.dispatch.capped, 3);
    assert_eq!(first.deferred_out, 3);
    assert_eq!(sup.deferred().await, vec!["C3", "C4", "C5"]);

    let second = cycle(&sup, day(0) + hours(2)).await;
    assert_eq!(second.transitions, 0);
    assert_eq!(second.deferred_in, 3);
    assert_eq!(second.dispatch.dispatched, 2);
    assert_eq!(second.deferred_out, 1);

    let third = cycle(&sup, day(0) + hours(3)).await;
    assert_eq!(third.dispatch.dispatched, 1);
    assert_eq!(third.deferred_out, 0);

    let mut actioned: Vec<String> = store.all_actions().into_iter().map(|a| a.entity_id).collect();
    actioned.sort();
    assert_eq!(actioned, vec!["C1", "C2", "C3", "C4", "C5"]);
}

#[tokio::test]
async fn deferred_entity_that_leaves_the_tier_is_dropped() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 1);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    seed_critical(&store, "C2", day(0)).await.unwrap();

    let first = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(first.dispatch.dispatched, 1);
    assert_eq!(first.deferred_out, 1);

    // Everything ages out of the window before the retry.
    let later = cycle(&sup, day(4)).await;
    assert_eq!(later.entities, 0);
    assert_eq!(later.deferred_expired, 1);
    assert_eq!(later.dispatch.dispatched, 0);
    assert_eq!(store.all_actions().len(), 1);
}

// =========================================================================
// External failures
// =========================================================================

#[tokio::test]
async fn generation_failure_is_deferred_and_retried() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    seed_critical(&store, "C2", day(0)).await.unwrap();
    generator.fail_for("C1");

    let first = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(first.dispatch.failed, 1);
    assert_eq!(first.dispatch.dispatched, 1);
    assert!(store.actions_for("C1").await.unwrap().is_empty());
    assert_eq!(store.actions_for("C2").await.unwrap().len(), 1);

    generator.recover("C1");
    let second = cycle(&sup, day(0) + hours(2)).await;
    assert_eq!(second.transitions, 0);
    assert_eq!(second.dispatch.dispatched, 1);
    assert_eq!(store.actions_for("C1").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_generation_times_out_without_blocking_the_batch() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    seed_critical(&store, "C2", day(0)).await.unwrap();
    generator.delay_for("C1", Duration::from_secs(60));

    let stats = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(stats.dispatch.timed_out, 1);
    assert_eq!(stats.dispatch.dispatched, 1);
    assert_eq!(sup.deferred().await, vec!["C1"]);
    assert!(store.actions_for("C1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_batch_defers_the_remainder() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    for id in ["C1", "C2", "C3"] {
        seed_critical(&store, id, day(0)).await.unwrap();
        generator.delay_for(id, Duration::from_millis(500));
    }

    let shutdown = CancellationToken::new();
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    };
    let (result, ()) = tokio::join!(sup.run_cycle_until(day(0) + hours(1), &shutdown), cancel);
    let stats = result.unwrap().expect("cycle should not be skipped");

    assert_eq!(generator.requests().len(), 1);
    assert_eq!(stats.dispatch.dispatched, 1);
    assert_eq!(stats.dispatch.interrupted, 2);
    assert_eq!(stats.deferred_out, 2);
    assert_eq!(store.all_actions().len(), 1);
}

#[tokio::test]
async fn context_failure_still_dispatches() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    store.fail_context_reads(true);

    let stats = cycle(&sup, day(0) + hours(1)).await;
    assert_eq!(stats.dispatch.context_failures, 1);
    assert_eq!(stats.dispatch.dispatched, 1);
    assert_eq!(generator.requests()[0].context, "");
}

#[tokio::test]
async fn failed_recompute_does_not_consume_the_edge() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    store.fail_aggregate_writes(true);
    assert!(sup.run_cycle(day(0) + hours(1)).await.is_err());
    assert!(store.all_actions().is_empty());

    store.fail_aggregate_writes(false);
    let stats = cycle(&sup, day(0) + hours(2)).await;
    assert_eq!(stats.transitions, 1);
    assert_eq!(stats.dispatch.dispatched, 1);
}

// =========================================================================
// Cooldown and re-entry
// =========================================================================

#[tokio::test]
async fn reentry_inside_cooldown_is_suppressed_and_after_it_is_actioned() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);

    seed_critical(&store, "C1", day(0)).await.unwrap();
    assert_eq!(cycle(&sup, day(0) + hours(1)).await.dispatch.dispatched, 1);

    // Leaves the window, then re-enters two days later.
    assert_eq!(cycle(&sup, day(4)).await.entities, 0);
    seed_critical(&store, "C1", day(4)).await.unwrap();
    let reentry = cycle(&sup, day(4) + hours(1)).await;
    assert_eq!(reentry.transitions, 1);
    assert_eq!(reentry.suppressed, 1);
    assert_eq!(reentry.dispatch.dispatched, 0);

    // Leaves again and re-enters after the cooldown has run out.
    assert_eq!(cycle(&sup, day(8)).await.entities, 0);
    seed_critical(&store, "C1", day(9)).await.unwrap();
    let after = cycle(&sup, day(9) + hours(1)).await;
    assert_eq!(after.transitions, 1);
    assert_eq!(after.suppressed, 0);
    assert_eq!(after.dispatch.dispatched, 1);

    let actions = store.actions_for("C1").await.unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions[1].created_at - actions[0].created_at >= chrono::Duration::days(7));
}

// =========================================================================
// Restart and single-flight
// =========================================================================

#[tokio::test]
async fn restart_does_not_refire_entities_already_high() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();

    seed_critical(&store, "C1", day(0)).await.unwrap();
    cycle(&supervisor(&store, &generator, 50), day(0) + hours(1)).await;
    assert_eq!(store.all_actions().len(), 1);

    // A fresh process seeds its detector from the stored aggregates.
    let restarted = supervisor(&store, &generator, 50);
    let stats = cycle(&restarted, day(0) + hours(2)).await;
    assert_eq!(stats.transitions, 0);
    assert_eq!(generator.calls_for("C1"), 1);
}

#[tokio::test]
async fn restart_rebuilds_deferred_entities_from_storage() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();

    seed_critical(&store, "C1", day(0)).await.unwrap();
    seed_critical(&store, "C2", day(0)).await.unwrap();
    let first = supervisor(&store, &generator, 1);
    let stats = cycle(&first, day(0) + hours(1)).await;
    assert_eq!(stats.dispatch.dispatched, 1);
    assert_eq!(first.deferred().await, vec!["C2"]);
    drop(first);

    // The deferred list died with the process; storage still knows C2 is
    // HIGH and unactioned.
    let restarted = supervisor(&store, &generator, 1);
    let stats = cycle(&restarted, day(0) + hours(2)).await;
    assert_eq!(stats.transitions, 0);
    assert_eq!(stats.deferred_in, 1);
    assert_eq!(stats.dispatch.dispatched, 1);

    for h in 3..6 {
        let stats = cycle(&restarted, day(0) + hours(h)).await;
        assert_eq!(stats.dispatch.dispatched, 0);
    }
    assert_eq!(store.actions_for("C1").await.unwrap().len(), 1);
    assert_eq!(store.actions_for("C2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn restart_after_lost_actions_is_still_gated_by_storage() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();

    seed_critical(&store, "C1", day(0)).await.unwrap();
    cycle(&supervisor(&store, &generator, 50), day(0) + hours(1)).await;

    // Wipe the materialization so the restarted detector sees a fresh edge.
    store.replace_aggregates(&[]).await.unwrap();
    let restarted = supervisor(&store, &generator, 50);
    let stats = cycle(&restarted, day(0) + hours(2)).await;
    assert_eq!(stats.transitions, 1);
    assert_eq!(stats.suppressed, 1);
    assert_eq!(store.all_actions().len(), 1);
}

#[tokio::test]
async fn held_cycle_lock_skips_the_cycle() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    let sup = supervisor(&store, &generator, 50);
    seed_critical(&store, "C1", day(0)).await.unwrap();

    assert!(store.acquire_cycle_lock(Duration::from_secs(1800)).await.unwrap());
    assert!(sup.run_cycle(day(0) + hours(1)).await.unwrap().is_none());
    assert!(store.all_actions().is_empty());

    store.release_cycle_lock().await.unwrap();
    assert_eq!(cycle(&sup, day(0) + hours(1)).await.dispatch.dispatched, 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_loop_actions_once_and_stops_on_shutdown() {
    let store = MemoryStore::new();
    let generator = MockGenerator::new();
    seed_critical(&store, "C1", Utc::now() - hours(1)).await.unwrap();

    let sup = Arc::new(supervisor(&store, &generator, 50));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let sup = sup.clone();
        let shutdown = shutdown.clone();
        async move { sup.run(Duration::from_secs(300), shutdown).await }
    });

    tokio::time::sleep(Duration::from_secs(16 * 60)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(store.all_actions().len(), 1);
    assert_eq!(generator.calls_for("C1"), 1);
}
