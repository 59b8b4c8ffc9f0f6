//! In-process runtime: claims orchestrator batches, replays turns,
//! executes activities, and fires timers, persisting everything through a
//! [`Provider`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{ExecutionMetadata, InstanceStatus, OrchestrationItem, Provider, WorkItem, now_millis};
use crate::{Action, Event};

pub mod registry;
pub mod turn;

use futures::FutureExt;
use registry::{ActivityRegistry, OrchestrationRegistry};
use turn::{OrchestrationTurn, TurnResult};

/// Configuration knobs for the dispatcher loops.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty. Lower = more
    /// responsive, higher CPU when idle.
    pub dispatcher_idle_sleep: Duration,
    /// Attempts before a failing ack abandons its batch back to the
    /// store.
    pub max_commit_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            max_commit_attempts: 5,
        }
    }
}

/// Passed to every activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub activity_name: String,
    /// Scheduling event id of this invocation, unique per instance.
    pub activity_id: u64,
}

/// Client-facing projection of an instance's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running {
        custom_status: Option<String>,
    },
    /// Released back to the store, waiting on activities, timers, or
    /// external events.
    Suspended {
        custom_status: Option<String>,
    },
    Completed {
        output: String,
        custom_status: Option<String>,
    },
    Failed {
        error: String,
        custom_status: Option<String>,
    },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. }
        )
    }

    pub fn custom_status(&self) -> Option<&str> {
        match self {
            OrchestrationStatus::NotFound => None,
            OrchestrationStatus::Running { custom_status }
            | OrchestrationStatus::Suspended { custom_status }
            | OrchestrationStatus::Completed { custom_status, .. }
            | OrchestrationStatus::Failed { custom_status, .. } => custom_status.as_deref(),
        }
    }
}

/// Worker pool driving orchestrations, activities, and timers against one
/// provider. Multiple runtimes may share a provider; the per-instance
/// lease keeps them from advancing the same instance concurrently.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a runtime with custom options.
    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; calling repeatedly
        // is fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            orchestrations,
            options,
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher(activities);
        let timer = runtime.clone().start_timer_dispatcher();
        let mut joins = runtime.joins.lock().await;
        joins.push(orch);
        joins.push(work);
        joins.push(timer);
        drop(joins);

        runtime
    }

    /// Abort the dispatcher tasks. In-flight batches are reclaimed by the
    /// provider once their lease expires.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = self.store.fetch_orchestration_item().await {
                    self.process_orchestration_item(item).await;
                } else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        })
    }

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let instance = item.instance.clone();

        // Terminal instances are immutable; whatever is still queued for
        // them (late timer fires, stray raises) is consumed without effect.
        if item.history.iter().any(Event::is_terminal) {
            debug!(instance = %instance, "dropping batch for terminal instance");
            self.ack_with_retry(&item.lock_token, Vec::new(), Vec::new(), Vec::new(), ExecutionMetadata::default())
                .await;
            return;
        }

        let started = item.history.iter().find_map(|e| match e {
            Event::OrchestrationStarted { name, input, .. } => Some((name.clone(), input.clone())),
            _ => None,
        });
        let start_msg = item.messages.iter().find_map(|m| match m {
            WorkItem::StartOrchestration { orchestration, input, .. } => Some((orchestration.clone(), input.clone())),
            _ => None,
        });
        let (orchestration_name, input, is_new) = match (started, start_msg) {
            (Some((name, input)), _) => (name, input, false),
            (None, Some((name, input))) => (name, input, true),
            (None, None) => {
                // Messages arrived before the start did; put the instance
                // back to Pending and let the start's batch handle them.
                warn!(instance = %instance, "batch without start or history");
                self.ack_with_retry(
                    &item.lock_token,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    ExecutionMetadata {
                        status: Some(InstanceStatus::Pending),
                        ..ExecutionMetadata::default()
                    },
                )
                .await;
                return;
            }
        };

        // Turn index only feeds logs; history length is a stable proxy.
        let turn_index = item.history.len() as u64;
        let mut turn = OrchestrationTurn::new(instance.clone(), turn_index, item.history.clone());
        if is_new {
            turn.push_started_event(&orchestration_name, &input);
        }

        let result = match self.orchestrations.get(&orchestration_name) {
            Some(handler) => {
                turn.prep_completions(&item.messages);
                // Seed None every turn: the in-function status view is
                // rebuilt from program-order writes during replay, keeping
                // get_custom_status deterministic. The persisted row is
                // projection only.
                turn.execute(handler, &orchestration_name, input, now_millis(), None)
            }
            None => {
                warn!(instance = %instance, orchestration = %orchestration_name, "unregistered orchestration");
                turn.fail(format!("unregistered:{orchestration_name}"))
            }
        };

        let (worker_items, timer_items) = work_items_for_actions(&instance, turn.pending_actions());
        let (custom_status, custom_status_bumps) = turn.custom_status_update();
        let metadata = match &result {
            TurnResult::Continue => ExecutionMetadata {
                status: Some(InstanceStatus::Suspended),
                output: None,
                custom_status,
                custom_status_bumps,
            },
            TurnResult::Completed(output) => ExecutionMetadata {
                status: Some(InstanceStatus::Completed),
                output: Some(output.clone()),
                custom_status,
                custom_status_bumps,
            },
            TurnResult::Failed(error) => ExecutionMetadata {
                status: Some(InstanceStatus::Failed),
                output: Some(error.clone()),
                custom_status,
                custom_status_bumps,
            },
        };

        debug!(
            instance = %instance,
            turn_index,
            history_delta = turn.history_delta().len(),
            worker_items = worker_items.len(),
            timer_items = timer_items.len(),
            result = ?result,
            "committing turn"
        );

        self.ack_with_retry(&item.lock_token, turn.take_history_delta(), worker_items, timer_items, metadata)
            .await;
    }

    /// Commit with exponential backoff on retryable store errors; on
    /// exhaustion the batch is abandoned so another dispatch cycle can
    /// retry it. History is only ever appended under the lock token, so
    /// retries cannot duplicate events.
    async fn ack_with_retry(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) {
        let mut attempt: u32 = 0;
        loop {
            match self
                .store
                .ack_orchestration_item(
                    lock_token,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    metadata.clone(),
                )
                .await
            {
                Ok(()) => return,
                Err(e) if !e.is_retryable() => {
                    // Stale token: the lease expired and another worker owns
                    // the instance now. Dropping our copy is the safe move.
                    warn!(error = %e, "permanent ack failure; dropping batch");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.options.max_commit_attempts {
                        warn!(error = %e, attempt, "ack retries exhausted; abandoning batch");
                        let _ = self
                            .store
                            .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                            .await;
                        return;
                    }
                    let backoff = Duration::from_millis(10u64.saturating_mul(1 << attempt.min(10)));
                    warn!(error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "ack failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: ActivityRegistry) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_worker_peek_lock().await {
                    match item {
                        WorkItem::ActivityExecute { instance, id, name, input } => {
                            let completion = Self::run_activity(&activities, &instance, id, &name, input).await;
                            if self.store.enqueue_orchestrator_work(completion, None).await.is_ok() {
                                let _ = self.store.ack_worker(&token).await;
                            } else {
                                warn!(instance = %instance, id, "enqueue of activity completion failed; abandoning");
                                let _ = self.store.abandon_worker(&token).await;
                            }
                        }
                        other => {
                            error!(kind = other.kind(), "unexpected work item on worker queue");
                            let _ = self.store.ack_worker(&token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        })
    }

    async fn run_activity(
        activities: &ActivityRegistry,
        instance: &str,
        id: u64,
        name: &str,
        input: String,
    ) -> WorkItem {
        let Some(handler) = activities.get(name) else {
            return WorkItem::ActivityFailed {
                instance: instance.to_string(),
                id,
                error: format!("unregistered:{name}"),
            };
        };
        let ctx = ActivityContext {
            instance: instance.to_string(),
            activity_name: name.to_string(),
            activity_id: id,
        };
        debug!(instance, id, activity = name, "executing activity");
        let invocation = std::panic::AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind();
        match invocation.await {
            Ok(Ok(result)) => WorkItem::ActivityCompleted {
                instance: instance.to_string(),
                id,
                result,
            },
            Ok(Err(error)) => WorkItem::ActivityFailed {
                instance: instance.to_string(),
                id,
                error,
            },
            Err(_) => WorkItem::ActivityFailed {
                instance: instance.to_string(),
                id,
                error: format!("activity panicked: {name}"),
            },
        }
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Timers ride the orchestrator queue's delayed visibility: a
        // schedule becomes a fired message that surfaces at its deadline.
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_timer_peek_lock().await {
                    match item {
                        WorkItem::TimerSchedule { instance, id, fire_at_ms } => {
                            let delay = Duration::from_millis(fire_at_ms.saturating_sub(now_millis()));
                            let fired = WorkItem::TimerFired {
                                instance: instance.clone(),
                                id,
                                fire_at_ms,
                            };
                            if self.store.enqueue_orchestrator_work(fired, Some(delay)).await.is_ok() {
                                let _ = self.store.ack_timer(&token).await;
                            } else {
                                warn!(instance = %instance, id, "enqueue of timer fire failed; abandoning");
                                let _ = self.store.abandon_timer(&token).await;
                            }
                        }
                        other => {
                            error!(kind = other.kind(), "unexpected work item on timer queue");
                            let _ = self.store.ack_timer(&token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        })
    }
}

fn work_items_for_actions(instance: &str, actions: &[Action]) -> (Vec<WorkItem>, Vec<WorkItem>) {
    let mut worker_items = Vec::new();
    let mut timer_items = Vec::new();
    for action in actions {
        match action {
            Action::CallActivity { scheduling_event_id, name, input } => worker_items.push(WorkItem::ActivityExecute {
                instance: instance.to_string(),
                id: *scheduling_event_id,
                name: name.clone(),
                input: input.clone(),
            }),
            Action::CreateTimer { scheduling_event_id, fire_at_ms } => timer_items.push(WorkItem::TimerSchedule {
                instance: instance.to_string(),
                id: *scheduling_event_id,
                fire_at_ms: *fire_at_ms,
            }),
            // Subscriptions are pure history; the correlator matches raises
            // against them with no dispatch needed.
            Action::WaitExternal { .. } => {}
        }
    }
    (worker_items, timer_items)
}
