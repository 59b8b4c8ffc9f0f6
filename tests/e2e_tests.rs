// End-to-end coverage of the basic dispatch loop: activity calls, status
// projection, failure surfacing, and client error contracts.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use windrose::runtime::{self, registry::ActivityRegistry};
use windrose::{Client, ClientError, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};

#[tokio::test]
async fn single_activity_completes_with_output() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Greet", |_ctx, name: String| async move { Ok(format!("hello {name}")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Hello", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Greet", input).await
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-hello", "Hello", "world").await.unwrap();

    let status = client
        .wait_for_orchestration("e2e-hello", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "hello world"),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn chained_activities_thread_results() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Append", |_ctx, input: String| async move { Ok(format!("{input}.")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Chain", |ctx: OrchestrationContext, input: String| async move {
            let a = ctx.schedule_activity("Append", input).await?;
            let b = ctx.schedule_activity("Append", a).await?;
            let c = ctx.schedule_activity("Append", b).await?;
            Ok(c)
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-chain", "Chain", "x").await.unwrap();

    match client.wait_for_orchestration("e2e-chain", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "x..."),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

/// Each distinct scheduling event leads to exactly one executor
/// invocation, however many times the orchestration is replayed.
#[tokio::test]
async fn activities_are_dispatched_exactly_once() {
    let store = common::create_in_memory_store();
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let activities = ActivityRegistry::builder()
        .register("Count", move |_ctx, input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();
    // Three turn boundaries -> at least three full replays of the function.
    let orchestrations = OrchestrationRegistry::builder()
        .register("Counted", |ctx: OrchestrationContext, _| async move {
            ctx.schedule_activity("Count", "1").await?;
            ctx.schedule_activity("Count", "2").await?;
            ctx.schedule_activity("Count", "3").await?;
            Ok("done".into())
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-count", "Counted", "").await.unwrap();
    client.wait_for_orchestration("e2e-count", Duration::from_secs(5)).await.unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 3, "one invocation per scheduling event");

    rt.shutdown().await;
}

#[tokio::test]
async fn activity_failure_is_a_value_the_function_can_compensate() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Flaky", |_ctx, _input: String| async move { Err("downstream unavailable".to_string()) })
        .register("Fallback", |_ctx, _input: String| async move { Ok("fallback-result".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Compensate", |ctx: OrchestrationContext, _| async move {
            match ctx.schedule_activity("Flaky", "").await {
                Ok(v) => Ok(v),
                Err(_) => ctx.schedule_activity("Fallback", "").await,
            }
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-comp", "Compensate", "").await.unwrap();

    match client.wait_for_orchestration("e2e-comp", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "fallback-result"),
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn unhandled_activity_failure_fails_the_instance() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Boom", |_ctx, _input: String| async move { Err("boom".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Propagate", |ctx: OrchestrationContext, _| async move {
            let v = ctx.schedule_activity("Boom", "").await?;
            Ok(v)
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-prop", "Propagate", "").await.unwrap();

    match client.wait_for_orchestration("e2e-prop", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Failed { error, .. } => assert_eq!(error, "boom"),
        other => panic!("expected Failed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_with_marker_error() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder().build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("MissingAct", |ctx: OrchestrationContext, _| async move {
            ctx.schedule_activity("DoesNotExist", "").await
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-missing-act", "MissingAct", "").await.unwrap();

    match client
        .wait_for_orchestration("e2e-missing-act", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { error, .. } => {
            assert_eq!(error, "unregistered:DoesNotExist")
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_immediately() {
    let store = common::create_in_memory_store();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-unreg", "Nope", "").await.unwrap();

    match client.wait_for_orchestration("e2e-unreg", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Failed { error, .. } => assert_eq!(error, "unregistered:Nope"),
        other => panic!("expected Failed, got {other:?}"),
    }

    // History still carries a proper start + terminal pair.
    let history = client.read_history("e2e-unreg").await.unwrap();
    assert!(matches!(history.first(), Some(Event::OrchestrationStarted { .. })));
    assert!(matches!(history.last(), Some(Event::OrchestrationFailed { .. })));

    rt.shutdown().await;
}

#[tokio::test]
async fn typed_activity_schema_mismatch_is_recoverable() {
    #[derive(serde::Deserialize)]
    struct Req {
        #[allow(dead_code)]
        n: u32,
    }

    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register_typed("Typed", |_ctx, req: Req| async move { Ok(req.n) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("BadPayload", |ctx: OrchestrationContext, _| async move {
            match ctx.schedule_activity("Typed", "definitely not json").await {
                Ok(v) => Ok(v),
                Err(e) => Ok(format!("rejected: {e}")),
            }
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-schema", "BadPayload", "").await.unwrap();

    match client.wait_for_orchestration("e2e-schema", Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output, .. } => {
            assert!(output.starts_with("rejected: schema mismatch:"), "got: {output}")
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn status_projection_for_unknown_instance_is_not_found() {
    let store = common::create_in_memory_store();
    let client = Client::new(store.clone());
    let status = client.get_orchestration_status("does-not-exist").await.unwrap();
    assert_eq!(status, OrchestrationStatus::NotFound);

    match client.raise_event("does-not-exist", "Evt", "{}").await {
        Err(ClientError::NotFound(instance)) => assert_eq!(instance, "does-not-exist"),
        other => panic!("expected NotFound, got {other:?}"),
    }

    match client.read_history("does-not-exist").await {
        Err(ClientError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn raising_against_terminal_instance_is_invalid_state() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx, _| async move { Ok("done".to_string()) })
        .build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), ActivityRegistry::builder().build(), orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-term", "Quick", "").await.unwrap();
    client.wait_for_orchestration("e2e-term", Duration::from_secs(5)).await.unwrap();

    match client.raise_event("e2e-term", "Late", "{}").await {
        Err(ClientError::InvalidState(msg)) => assert!(msg.contains("Completed"), "got: {msg}"),
        other => panic!("expected InvalidState, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_start_is_already_exists() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx, _| async move { Ok("done".to_string()) })
        .build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), ActivityRegistry::builder().build(), orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-dup", "Quick", "").await.unwrap();

    match client.start_orchestration("e2e-dup", "Quick", "").await {
        Err(ClientError::AlreadyExists(instance)) => assert_eq!(instance, "e2e-dup"),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn auto_generated_instance_ids_are_unique() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx, _| async move { Ok("done".to_string()) })
        .build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), ActivityRegistry::builder().build(), orchestrations).await;
    let client = Client::new(store.clone());

    let a = client.start_orchestration_auto("Quick", "").await.unwrap();
    let b = client.start_orchestration_auto("Quick", "").await.unwrap();
    assert_ne!(a, b);
    client.wait_for_orchestration(&a, Duration::from_secs(5)).await.unwrap();
    client.wait_for_orchestration(&b, Duration::from_secs(5)).await.unwrap();

    rt.shutdown().await;
}

#[tokio::test]
async fn history_records_the_full_audit_trail() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Echo", |_ctx, input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Audited", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Echo", input).await
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("e2e-audit", "Audited", "ping").await.unwrap();
    client.wait_for_orchestration("e2e-audit", Duration::from_secs(5)).await.unwrap();

    let history = client.read_history("e2e-audit").await.unwrap();
    assert!(matches!(&history[0], Event::OrchestrationStarted { name, input, .. } if name == "Audited" && input == "ping"));
    assert!(matches!(&history[1], Event::ActivityScheduled { name, .. } if name == "Echo"));
    assert!(matches!(&history[2], Event::ActivityCompleted { result, .. } if result == "ping"));
    assert!(matches!(&history[3], Event::OrchestrationCompleted { output, .. } if output == "ping"));
    assert_eq!(history.len(), 4);
    // Sequence ids are dense and start at 1.
    for (i, e) in history.iter().enumerate() {
        assert_eq!(e.event_id(), i as u64 + 1);
    }

    rt.shutdown().await;
}
