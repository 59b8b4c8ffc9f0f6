//! windrose: a durable workflow orchestration engine.
//!
//! Orchestrations are ordinary `async fn`s that request side effects
//! (activities, timers, external-event waits) through an
//! [`OrchestrationContext`]. Every request is recorded as an event in an
//! append-only per-instance history; after a suspension or a process
//! restart the orchestration function is re-executed against that history
//! and fast-forwarded to where it left off. Side effects are dispatched
//! only when their scheduling event is first created, never while
//! replaying, which gives exactly-once dispatch per history entry.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use windrose::{Client, OrchestrationContext, OrchestrationRegistry};
//! use windrose::runtime::{self, registry::ActivityRegistry};
//!
//! # async fn demo() {
//! let store = Arc::new(windrose::providers::in_memory::InMemoryProvider::default());
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorkflow", |ctx: OrchestrationContext, input: String| async move {
//!         let greeting = ctx.schedule_activity("Greet", input).await?;
//!         Ok(greeting)
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
//! let client = Client::new(store);
//! client.start_orchestration("inst-1", "HelloWorkflow", "world").await.unwrap();
//! client.wait_for_orchestration("inst-1", Duration::from_secs(5)).await.unwrap();
//! rt.shutdown().await;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod client;
pub mod codec;
pub mod futures;
pub mod providers;
pub mod runtime;

pub use crate::client::{Client, ClientError, WaitError};
pub use crate::futures::{DurableFuture, DurableOutput};
pub use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use crate::runtime::{ActivityContext, OrchestrationStatus};

/// The first event of every history (`OrchestrationStarted`) has this id.
pub const INITIAL_EVENT_ID: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

/// One entry of an instance's append-only history.
///
/// `event_id` is assigned in strict append order starting at
/// [`INITIAL_EVENT_ID`]. Scheduling events (`ActivityScheduled`,
/// `TimerCreated`, `ExternalSubscribed`) are claimed by replaying code in
/// the order the orchestration requested them; completion events point
/// back at their scheduling event through `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    /// Historized non-determinism: wall-clock reads, generated ids, and
    /// one-shot trace emission. The recorded `value` is adopted verbatim
    /// on replay so the orchestration observes the same answer forever.
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. } => *event_id = id,
        }
    }

    /// Terminal events freeze the instance; nothing may be appended after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. }
        )
    }
}

/// A side effect the scheduler must dispatch after persisting the turn.
///
/// Actions are recorded only when the corresponding scheduling event is
/// newly created; replayed (adopted) events never produce actions, which
/// is what makes dispatch exactly-once per history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) orchestration_name: String,
    pub(crate) turn_index: u64,
    /// Working history: baseline + this turn's completion events, extended
    /// in place with newly created scheduling events while polling.
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    /// Sources whose completions no longer gate FIFO consumption: race
    /// losers whose futures were dropped without being consumed.
    pub(crate) cancelled_source_ids: HashSet<u64>,
    pub(crate) consumed_external_events: HashSet<String>,
    pub(crate) nondeterminism: Option<String>,
    /// Wall clock captured once by the scheduler at the start of the turn.
    /// Never handed to user code directly; only historized values escape.
    pub(crate) wall_now_ms: u64,
    pub(crate) custom_status: Option<String>,
    pub(crate) custom_status_writes: u64,
    pub(crate) guid_seed: u64,
}

impl CtxInner {
    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn set_nondeterminism(&mut self, msg: String) {
        // First detection wins; later mismatches are usually knock-on noise.
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(msg);
        }
    }

    /// Adopt a recorded `SystemCall` for `op`, or append a fresh one with
    /// `value_fn`'s answer. Returns the historized value and whether it
    /// was freshly computed.
    fn system_call(&mut self, op: &str, value_fn: impl FnOnce(&mut Self) -> String) -> (String, bool) {
        let found = self.history.iter().find_map(|e| match e {
            Event::SystemCall { event_id, op: hop, value }
                if hop == op && !self.claimed_scheduling_events.contains(event_id) =>
            {
                Some((*event_id, value.clone()))
            }
            _ => None,
        });
        if let Some((event_id, value)) = found {
            self.claimed_scheduling_events.insert(event_id);
            return (value, false);
        }
        let value = value_fn(self);
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        self.history.push(Event::SystemCall {
            event_id,
            op: op.to_string(),
            value: value.clone(),
        });
        self.claimed_scheduling_events.insert(event_id);
        (value, true)
    }

    /// Progress fingerprint for the fixed-point poll loop in [`run_turn`].
    fn progress_stamp(&self) -> (usize, usize, usize, u64) {
        (
            self.actions.len(),
            self.claimed_scheduling_events.len(),
            self.consumed_completions.len(),
            self.next_event_id,
        )
    }
}

/// Handle through which orchestration code requests durable operations.
///
/// Cheap to clone; all clones share one turn-scoped state. Orchestration
/// code must route every non-deterministic observation through this
/// handle; anything else diverges on replay and fails the instance with
/// a non-determinism error.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance: impl Into<String>,
        orchestration_name: impl Into<String>,
        turn_index: u64,
        wall_now_ms: u64,
        custom_status: Option<String>,
        history: Vec<Event>,
    ) -> Self {
        let next_event_id = history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance: instance.into(),
                orchestration_name: orchestration_name.into(),
                turn_index,
                history,
                actions: Vec::new(),
                next_event_id,
                claimed_scheduling_events: HashSet::new(),
                consumed_completions: HashSet::new(),
                cancelled_source_ids: HashSet::new(),
                consumed_external_events: HashSet::new(),
                nondeterminism: None,
                wall_now_ms,
                custom_status,
                custom_status_writes: 0,
                guid_seed: 0,
            })),
        }
    }

    /// Instance id of the running orchestration.
    pub fn instance(&self) -> String {
        self.inner.lock().expect("ctx lock").instance.clone()
    }

    /// Zero-based index of the current dispatch turn.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().expect("ctx lock").turn_index
    }

    /// Schedule an activity invocation. Resolves to the activity's result,
    /// or to its failure as an `Err` value the orchestration can inspect,
    /// retry, or compensate for.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> crate::futures::ActivityFuture {
        crate::futures::ActivityFuture::new(self.clone(), name.into(), input.into())
    }

    /// Schedule an activity with a JSON-typed input and output.
    pub async fn schedule_activity_typed<In, Out>(&self, name: &str, input: &In) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let payload = crate::codec::Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        let raw = self.schedule_activity(name, payload).await?;
        crate::codec::Json::decode(&raw).map_err(|e| format!("schema mismatch: {e}"))
    }

    /// Arm a durable timer that fires `delay` after the turn in which it
    /// was first scheduled. The deadline is historized, so replays observe
    /// the same wall-clock instant.
    pub fn schedule_timer(&self, delay: std::time::Duration) -> crate::futures::TimerFuture {
        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        crate::futures::TimerFuture::new(self.clone(), delay_ms)
    }

    /// Subscribe to a named external event and resolve with its payload.
    pub fn schedule_wait(&self, name: impl Into<String>) -> crate::futures::ExternalFuture {
        crate::futures::ExternalFuture::new(self.clone(), name.into())
    }

    /// Race an arbitrary set of pending operations; resolves with the
    /// winner's index and output. The winner is the operation whose
    /// completion carries the lowest history sequence number, stable
    /// across replays. Losers stay dormant and their eventual completions
    /// are discarded.
    pub fn select(&self, futures: Vec<DurableFuture>) -> crate::futures::SelectFuture {
        crate::futures::SelectFuture::new(self.clone(), futures)
    }

    /// Wait for every operation; outputs are returned in completion
    /// (history) order, not argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> crate::futures::JoinFuture {
        crate::futures::JoinFuture::new(self.clone(), futures)
    }

    /// Historized wall-clock read (milliseconds since the Unix epoch).
    pub fn utc_now_ms(&self) -> u64 {
        let mut inner = self.inner.lock().expect("ctx lock");
        let now = inner.wall_now_ms;
        let (value, _) = inner.system_call(SYSCALL_OP_UTCNOW_MS, |_| now.to_string());
        value.parse().unwrap_or(now)
    }

    /// Historized unique id, stable across replays.
    pub fn new_guid(&self) -> String {
        let mut inner = self.inner.lock().expect("ctx lock");
        let (value, _) = inner.system_call(SYSCALL_OP_GUID, |i| {
            i.guid_seed += 1;
            let seed = i.guid_seed;
            let now = i.wall_now_ms;
            format!(
                "{:08x}-{:04x}-{:012x}",
                (now >> 16) as u32,
                seed as u16,
                now & 0xffff_ffff_ffff
            )
        });
        value
    }

    /// Emit an info-level trace exactly once: logged when first executed,
    /// silently adopted from history on every replay.
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    /// Warn-level variant of [`trace_info`](Self::trace_info).
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    fn trace(&self, level: &str, message: String) {
        let mut inner = self.inner.lock().expect("ctx lock");
        let op = format!("{SYSCALL_OP_TRACE_PREFIX}{level}:{message}");
        let instance = inner.instance.clone();
        let orchestration = inner.orchestration_name.clone();
        let turn_index = inner.turn_index;
        let (_, fresh) = inner.system_call(&op, |_| String::new());
        drop(inner);
        if fresh {
            match level {
                "WARN" => tracing::warn!(
                    target: "windrose::orchestration",
                    instance = %instance,
                    orchestration = %orchestration,
                    turn_index,
                    "{message}"
                ),
                _ => tracing::info!(
                    target: "windrose::orchestration",
                    instance = %instance,
                    orchestration = %orchestration,
                    turn_index,
                    "{message}"
                ),
            }
        }
    }

    /// Overwrite the instance's progress snapshot visible to pollers.
    /// Not historized; replayed re-writes of the same value are harmless.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let mut inner = self.inner.lock().expect("ctx lock");
        inner.custom_status = Some(status.into());
        inner.custom_status_writes += 1;
    }

    /// Clear the progress snapshot.
    pub fn reset_custom_status(&self) {
        let mut inner = self.inner.lock().expect("ctx lock");
        inner.custom_status = None;
        inner.custom_status_writes += 1;
    }

    /// Current progress snapshot as seen by this turn.
    pub fn get_custom_status(&self) -> Option<String> {
        self.inner.lock().expect("ctx lock").custom_status.clone()
    }

    pub(crate) fn take_nondeterminism(&self) -> Option<String> {
        self.inner.lock().expect("ctx lock").nondeterminism.clone()
    }
}

// ---------------------------------------------------------------------------
// Turn driver
// ---------------------------------------------------------------------------

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Everything a single replay pass produced.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Baseline history plus events created during this turn.
    pub history: Vec<Event>,
    /// Side effects to dispatch (only for newly created scheduling events).
    pub actions: Vec<Action>,
    /// Terminal result, if the orchestration function returned.
    pub output: Option<Result<String, String>>,
    /// Set when history and code diverged; the instance must fail.
    pub nondeterminism: Option<String>,
    /// Custom status view at the end of the turn plus the number of
    /// set/reset calls observed (0 = untouched, nothing to persist).
    pub custom_status: Option<String>,
    pub custom_status_writes: u64,
}

/// Execute one replay pass of `orchestrator` against `history`.
///
/// The function is polled with a no-op waker to a fixed point: durable
/// futures resolve instantly from recorded completions, and the first
/// not-yet-satisfied request leaves the turn suspended with its actions
/// captured for dispatch. Identical inputs always produce identical
/// outcomes; this is the replay-determinism contract.
#[allow(clippy::too_many_arguments)]
pub fn run_turn<F, Fut>(
    instance: impl Into<String>,
    orchestration_name: impl Into<String>,
    turn_index: u64,
    wall_now_ms: u64,
    custom_status: Option<String>,
    history: Vec<Event>,
    input: String,
    orchestrator: F,
) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(
        instance,
        orchestration_name,
        turn_index,
        wall_now_ms,
        custom_status,
        history,
    );
    let mut fut = orchestrator(ctx.clone(), input);
    // Safety: the future is stack-pinned for the duration of this call and
    // never moved afterwards.
    let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
    let waker = noop_waker();
    let mut poll_cx = Context::from_waker(&waker);

    let mut output = None;
    loop {
        let before = ctx.inner.lock().expect("ctx lock").progress_stamp();
        match fut.as_mut().poll(&mut poll_cx) {
            Poll::Ready(res) => {
                output = Some(res);
                break;
            }
            Poll::Pending => {
                let after = ctx.inner.lock().expect("ctx lock").progress_stamp();
                if after == before {
                    break;
                }
            }
        }
    }

    let nondeterminism = ctx.take_nondeterminism();
    let inner = ctx.inner.lock().expect("ctx lock");
    TurnOutcome {
        history: inner.history.clone(),
        actions: inner.actions.clone(),
        // A turn that tripped the non-determinism detector produced garbage
        // decisions; the caller must fail the instance instead.
        output: if nondeterminism.is_some() { None } else { output },
        nondeterminism,
        custom_status: inner.custom_status.clone(),
        custom_status_writes: inner.custom_status_writes,
    }
}
