// Races between external events and timers: winner determinism, loser
// no-op semantics, and compatibility with stock futures combinators.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use futures::future::{Either, select};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use windrose::runtime::{self, registry::ActivityRegistry, RuntimeOptions};
use windrose::{Client, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn external_event_resolves_wait() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WaitOnly", |ctx: OrchestrationContext, _| async move {
            let data = ctx.schedule_wait("Only").await;
            Ok(format!("only={data}"))
        })
        .build();

    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-wait-1", "WaitOnly", "").await.unwrap();

    assert!(common::wait_for_subscription(&store, "race-wait-1", "Only", 2000).await);
    client.raise_event("race-wait-1", "Only", "payload").await.unwrap();

    match client.wait_for_orchestration("race-wait-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "only=payload"),
        other => panic!("expected Completed, got {other:?}"),
    }

    // Audit: subscription precedes delivery, completion is terminal.
    let history = client.read_history("race-wait-1").await.unwrap();
    assert!(matches!(&history[0], Event::OrchestrationStarted { .. }));
    assert!(matches!(&history[1], Event::ExternalSubscribed { .. }));
    assert!(matches!(&history[2], Event::ExternalEvent { .. }));
    assert!(matches!(history.last().unwrap(), Event::OrchestrationCompleted { .. }));

    rt.shutdown().await;
}

async fn race_via_select_primitive(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    let approval = ctx.schedule_wait("Race");
    let timeout = ctx.schedule_timer(Duration::from_millis(75));
    let (winner, _output) = ctx.select(vec![approval.into(), timeout.into()]).await;
    match winner {
        0 => Ok("external".into()),
        _ => Ok("timer".into()),
    }
}

#[tokio::test]
async fn timer_wins_when_no_event_is_raised() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", race_via_select_primitive)
        .build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-timer-1", "Race", "").await.unwrap();

    match client.wait_for_orchestration("race-timer-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "timer"),
        other => panic!("expected Completed, got {other:?}"),
    }

    // The external event never appears in history.
    let history = client.read_history("race-timer-1").await.unwrap();
    assert!(!history.iter().any(|e| matches!(e, Event::ExternalEvent { .. })));

    rt.shutdown().await;
}

#[tokio::test]
async fn external_wins_when_raised_before_deadline() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _| async move {
            let approval = ctx.schedule_wait("Race");
            let timeout = ctx.schedule_timer(Duration::from_secs(30));
            let (winner, _output) = ctx.select(vec![approval.into(), timeout.into()]).await;
            match winner {
                0 => Ok("external".into()),
                _ => Ok("timer".into()),
            }
        })
        .build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-ext-1", "Race", "").await.unwrap();

    assert!(common::wait_for_subscription(&store, "race-ext-1", "Race", 2000).await);
    client.raise_event("race-ext-1", "Race", "ok").await.unwrap();

    match client.wait_for_orchestration("race-ext-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "external"),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

/// Work scheduled after a decided race must not be blocked by the losing
/// timer firing later, and the follow-up activity runs exactly once.
#[tokio::test]
async fn loser_timer_fire_is_a_harmless_noop() {
    let store = common::create_in_memory_store();
    let bookings = Arc::new(AtomicUsize::new(0));
    let counter = bookings.clone();
    let activities = ActivityRegistry::builder()
        .register("Book", move |_ctx, input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("booked:{input}"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RaceThenBook", |ctx: OrchestrationContext, _| async move {
            let approval = ctx.schedule_wait("Approve");
            // Short timer: it will fire into the already-decided race.
            let timeout = ctx.schedule_timer(Duration::from_millis(100));
            let (winner, _output) = ctx.select(vec![approval.into(), timeout.into()]).await;
            if winner == 0 {
                ctx.schedule_activity("Book", "trip").await
            } else {
                Ok("timed out".into())
            }
        })
        .build();

    let rt = runtime::Runtime::start_with_options(store.clone(), activities, orchestrations, fast_options()).await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-loser-1", "RaceThenBook", "").await.unwrap();

    assert!(common::wait_for_subscription(&store, "race-loser-1", "Approve", 2000).await);
    client.raise_event("race-loser-1", "Approve", "yes").await.unwrap();

    match client.wait_for_orchestration("race-loser-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "booked:trip"),
        other => panic!("expected Completed, got {other:?}"),
    }
    assert_eq!(bookings.load(Ordering::SeqCst), 1);

    // Give the loser timer time to fire into the terminal instance.
    tokio::time::sleep(Duration::from_millis(200)).await;
    match client.get_orchestration_status("race-loser-1").await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "booked:trip"),
        other => panic!("terminal status must be stable, got {other:?}"),
    }

    rt.shutdown().await;
}

/// The typed futures are plain `Unpin` futures, so stock combinators like
/// `futures::future::select` work for a race that ends the orchestration.
#[tokio::test]
async fn stock_select_combinator_races_timer_and_event() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("StockRace", |ctx: OrchestrationContext, _| async move {
            let race = select(ctx.schedule_timer(Duration::from_millis(60)), ctx.schedule_wait("Go"));
            match race.await {
                Either::Left((_t, _w)) => Ok("timer".to_string()),
                Either::Right((_w, _t)) => Ok("external".to_string()),
            }
        })
        .build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-stock-1", "StockRace", "").await.unwrap();

    match client.wait_for_orchestration("race-stock-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "timer"),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

/// Two events with the same name are consumed in history order.
#[tokio::test]
async fn repeated_events_resolve_sequential_waits_in_order() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoWaits", |ctx: OrchestrationContext, _| async move {
            let first = ctx.schedule_wait("Step").await;
            let second = ctx.schedule_wait("Step").await;
            Ok(format!("{first},{second}"))
        })
        .build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-two-1", "TwoWaits", "").await.unwrap();

    assert!(common::wait_for_subscription(&store, "race-two-1", "Step", 2000).await);
    client.raise_event("race-two-1", "Step", "one").await.unwrap();

    // Second subscription appears after the first event is consumed.
    assert!(
        common::wait_for_history(
            &store,
            "race-two-1",
            |hist| {
                hist.iter()
                    .filter(|e| matches!(e, Event::ExternalSubscribed { .. }))
                    .count()
                    >= 2
            },
            2000,
        )
        .await
    );
    client.raise_event("race-two-1", "Step", "two").await.unwrap();

    match client.wait_for_orchestration("race-two-1", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "one,two"),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}
