//! Durable futures: the replay cursor model.
//!
//! Every awaitable the orchestration creates is a [`DurableFuture`]. On
//! poll it first *claims* the next unclaimed scheduling event in history
//! order: adopting the recorded event when replaying, or appending a new
//! one (and recording a dispatch [`Action`]) when executing fresh
//! territory. It then looks for its completion by `source_event_id`,
//! gated by FIFO consumption: a completion is consumable only once every
//! earlier completion has been consumed or belongs to a cancelled
//! (race-loser) source. A claim that does not match the recorded event is
//! a non-determinism error and fails the instance.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, CtxInner, Event, OrchestrationContext};

/// Output of a resolved [`DurableFuture`].
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Activity { name: String, input: String },
    Timer { delay_ms: u64 },
    External { name: String },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            Kind::Timer { .. } => "TimerCreated".to_string(),
            Kind::External { name } => format!("ExternalSubscribed('{name}')"),
        }
    }
}

fn describe_scheduling_event(e: &Event) -> String {
    match e {
        Event::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
        Event::TimerCreated { .. } => "TimerCreated".to_string(),
        Event::ExternalSubscribed { name, .. } => format!("ExternalSubscribed('{name}')"),
        other => format!("{other:?}"),
    }
}

fn is_scheduling_event(e: &Event) -> bool {
    matches!(
        e,
        Event::ActivityScheduled { .. } | Event::TimerCreated { .. } | Event::ExternalSubscribed { .. }
    )
}

fn is_completion_event(e: &Event) -> bool {
    matches!(
        e,
        Event::ActivityCompleted { .. }
            | Event::ActivityFailed { .. }
            | Event::TimerFired { .. }
            | Event::ExternalEvent { .. }
    )
}

/// True when every subscription for `name` lost a race; such an external
/// event can never be consumed and must not block FIFO ordering.
fn external_subscriptions_all_cancelled(inner: &CtxInner, name: &str) -> bool {
    let mut saw_any = false;
    for e in &inner.history {
        if let Event::ExternalSubscribed { event_id, name: sub_name } = e {
            if sub_name == name {
                saw_any = true;
                if !inner.cancelled_source_ids.contains(event_id) {
                    return false;
                }
            }
        }
    }
    saw_any
}

/// FIFO gate: `completion_event_id` may be consumed only when every
/// completion before it is consumed, belongs to a cancelled source, or is
/// an external event whose subscriptions were all cancelled.
fn can_consume_completion(inner: &CtxInner, completion_event_id: u64) -> bool {
    inner.history.iter().all(|e| {
        if !is_completion_event(e) || e.event_id() >= completion_event_id {
            return true;
        }
        if inner.consumed_completions.contains(&e.event_id()) {
            return true;
        }
        match e {
            Event::ActivityCompleted { source_event_id, .. }
            | Event::ActivityFailed { source_event_id, .. }
            | Event::TimerFired { source_event_id, .. } => inner.cancelled_source_ids.contains(source_event_id),
            Event::ExternalEvent { name, .. } => external_subscriptions_all_cancelled(inner, name),
            _ => true,
        }
    })
}

/// A suspended point of the orchestration: an activity call, a timer, or
/// an external-event wait. In-memory only, never persisted; the durable
/// counterpart is its scheduling event in history.
pub struct DurableFuture {
    pub(crate) ctx: OrchestrationContext,
    pub(crate) kind: Kind,
    pub(crate) claimed_event_id: Cell<Option<u64>>,
    pub(crate) consumed: Cell<bool>,
    cached: RefCell<Option<DurableOutput>>,
}

impl DurableFuture {
    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            claimed_event_id: Cell::new(None),
            consumed: Cell::new(false),
            cached: RefCell::new(None),
        }
    }

    /// Claim our scheduling event: adopt the next unclaimed one from
    /// history, or create it (recording the dispatch action). Returns
    /// `None` when the claim detected non-determinism.
    fn ensure_claimed(&self, inner: &mut CtxInner) -> Option<u64> {
        if let Some(id) = self.claimed_event_id.get() {
            return Some(id);
        }

        let next_recorded = inner
            .history
            .iter()
            .find(|e| is_scheduling_event(e) && !inner.claimed_scheduling_events.contains(&e.event_id()))
            .cloned();

        let event_id = match next_recorded {
            Some(recorded) => {
                let matches = match (&self.kind, &recorded) {
                    (Kind::Activity { name, input }, Event::ActivityScheduled { name: n, input: i, .. }) => {
                        name == n && input == i
                    }
                    (Kind::Timer { .. }, Event::TimerCreated { .. }) => true,
                    (Kind::External { name }, Event::ExternalSubscribed { name: n, .. }) => name == n,
                    _ => false,
                };
                if !matches {
                    inner.set_nondeterminism(format!(
                        "nondeterministic: schedule order mismatch: next is {} but expected {}",
                        describe_scheduling_event(&recorded),
                        self.kind.describe()
                    ));
                    return None;
                }
                recorded.event_id()
            }
            None => {
                let new_id = inner.next_event_id;
                inner.next_event_id += 1;
                match &self.kind {
                    Kind::Activity { name, input } => {
                        inner.history.push(Event::ActivityScheduled {
                            event_id: new_id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::CallActivity {
                            scheduling_event_id: new_id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    Kind::Timer { delay_ms } => {
                        let fire_at_ms = inner.wall_now_ms.saturating_add(*delay_ms);
                        inner.history.push(Event::TimerCreated {
                            event_id: new_id,
                            fire_at_ms,
                        });
                        inner.record_action(Action::CreateTimer {
                            scheduling_event_id: new_id,
                            fire_at_ms,
                        });
                    }
                    Kind::External { name } => {
                        inner.history.push(Event::ExternalSubscribed {
                            event_id: new_id,
                            name: name.clone(),
                        });
                        inner.record_action(Action::WaitExternal {
                            scheduling_event_id: new_id,
                            name: name.clone(),
                        });
                    }
                }
                new_id
            }
        };

        inner.claimed_scheduling_events.insert(event_id);
        self.claimed_event_id.set(Some(event_id));
        Some(event_id)
    }

    /// Locate our completion event without consuming it.
    fn find_completion(&self, inner: &CtxInner, our_id: u64) -> Option<(u64, DurableOutput)> {
        match &self.kind {
            Kind::Activity { .. } => inner.history.iter().find_map(|e| match e {
                Event::ActivityCompleted { event_id, source_event_id, result }
                    if *source_event_id == our_id =>
                {
                    Some((*event_id, DurableOutput::Activity(Ok(result.clone()))))
                }
                Event::ActivityFailed { event_id, source_event_id, error } if *source_event_id == our_id => {
                    Some((*event_id, DurableOutput::Activity(Err(error.clone()))))
                }
                _ => None,
            }),
            Kind::Timer { .. } => inner.history.iter().find_map(|e| match e {
                Event::TimerFired { event_id, source_event_id, .. } if *source_event_id == our_id => {
                    Some((*event_id, DurableOutput::Timer))
                }
                _ => None,
            }),
            // External events carry no source id; they correlate by name,
            // earliest unconsumed first.
            Kind::External { name } => inner.history.iter().find_map(|e| match e {
                Event::ExternalEvent { event_id, name: n, data }
                    if n == name && !inner.consumed_completions.contains(event_id) =>
                {
                    Some((*event_id, DurableOutput::External(data.clone())))
                }
                _ => None,
            }),
        }
    }

    /// Sequence number of our completion, if it is already in history.
    /// Used by select/join to pick winners without consuming anything.
    fn pending_completion_id(&self, inner: &CtxInner) -> Option<u64> {
        let our_id = self.claimed_event_id.get()?;
        self.find_completion(inner, our_id).map(|(id, _)| id)
    }

    fn poll_inner(&self) -> Poll<DurableOutput> {
        if let Some(out) = self.cached.borrow().clone() {
            return Poll::Ready(out);
        }

        let mut inner = self.ctx.inner.lock().expect("ctx lock");
        let Some(our_id) = self.ensure_claimed(&mut inner) else {
            return Poll::Pending;
        };

        if let Some((completion_id, output)) = self.find_completion(&inner, our_id) {
            if can_consume_completion(&inner, completion_id) {
                inner.consumed_completions.insert(completion_id);
                drop(inner);
                self.consumed.set(true);
                *self.cached.borrow_mut() = Some(output.clone());
                return Poll::Ready(output);
            }
        }
        Poll::Pending
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_inner()
    }
}

impl Drop for DurableFuture {
    fn drop(&mut self) {
        // A claimed but never-consumed future is a race loser; mark its
        // source so its eventual completion cannot block FIFO consumption.
        if self.consumed.get() {
            return;
        }
        if let Some(id) = self.claimed_event_id.get() {
            if let Ok(mut inner) = self.ctx.inner.lock() {
                inner.cancelled_source_ids.insert(id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typed wrappers
// ---------------------------------------------------------------------------

/// Future of an activity result. `Err` carries the activity's failure for
/// the orchestration to handle.
pub struct ActivityFuture(DurableFuture);

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self(DurableFuture::new(ctx, Kind::Activity { name, input }))
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Activity(r)) => Poll::Ready(r),
            Poll::Ready(other) => unreachable!("activity future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl From<ActivityFuture> for DurableFuture {
    fn from(f: ActivityFuture) -> Self {
        f.0
    }
}

/// Future of a durable timer.
pub struct TimerFuture(DurableFuture);

impl TimerFuture {
    pub(crate) fn new(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self(DurableFuture::new(ctx, Kind::Timer { delay_ms }))
    }
}

impl Future for TimerFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
            Poll::Ready(other) => unreachable!("timer future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl From<TimerFuture> for DurableFuture {
    fn from(f: TimerFuture) -> Self {
        f.0
    }
}

/// Future of an external event's payload.
pub struct ExternalFuture(DurableFuture);

impl ExternalFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String) -> Self {
        Self(DurableFuture::new(ctx, Kind::External { name }))
    }
}

impl Future for ExternalFuture {
    type Output = String;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::External(data)) => Poll::Ready(data),
            Poll::Ready(other) => unreachable!("external future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl From<ExternalFuture> for DurableFuture {
    fn from(f: ExternalFuture) -> Self {
        f.0
    }
}

// ---------------------------------------------------------------------------
// Race-of-N and fan-in
// ---------------------------------------------------------------------------

/// Race of N pending operations, keyed by completion sequence number.
///
/// All children are polled claim-first on every pass so that replay keeps
/// the scheduling order stable even when the winner resolves instantly.
/// The winner is the child whose completion carries the lowest consumable
/// sequence number; losers are marked cancelled the moment the race
/// resolves.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Phase 1: every child claims its scheduling event. Skipping this
        // would desynchronize the claim cursor on replay when the winner
        // resolves before the losers ever get polled.
        {
            let mut inner = this.ctx.inner.lock().expect("ctx lock");
            for child in &this.children {
                let _ = child.ensure_claimed(&mut inner);
            }
            if inner.nondeterminism.is_some() {
                return Poll::Pending;
            }

            // Phase 2: find the consumable completion with the lowest
            // sequence number.
            let mut winner: Option<(usize, u64)> = None;
            for (i, child) in this.children.iter().enumerate() {
                if let Some(completion_id) = child.pending_completion_id(&inner) {
                    if can_consume_completion(&inner, completion_id)
                        && winner.is_none_or(|(_, best)| completion_id < best)
                    {
                        winner = Some((i, completion_id));
                    }
                }
            }

            let Some((winner_idx, _)) = winner else {
                return Poll::Pending;
            };

            // Phase 3: losers are cancelled so their completions stop
            // gating FIFO consumption from here on.
            for (i, child) in this.children.iter().enumerate() {
                if i != winner_idx {
                    if let Some(id) = child.claimed_event_id.get() {
                        inner.cancelled_source_ids.insert(id);
                    }
                }
            }
            drop(inner);

            match Pin::new(&mut this.children[winner_idx]).poll(cx) {
                Poll::Ready(output) => Poll::Ready((winner_idx, output)),
                Poll::Pending => unreachable!("winner was consumable"),
            }
        }
    }
}

/// Fan-in of N operations; resolves once all have completed, yielding
/// outputs in completion (history) order.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    resolved: Vec<Option<(u64, DurableOutput)>>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        let n = children.len();
        Self {
            ctx,
            children,
            resolved: (0..n).map(|_| None).collect(),
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        {
            let mut inner = this.ctx.inner.lock().expect("ctx lock");
            for child in &this.children {
                let _ = child.ensure_claimed(&mut inner);
            }
            if inner.nondeterminism.is_some() {
                return Poll::Pending;
            }
        }

        // Consume completions one at a time in sequence order; each
        // consumption may unblock the next.
        loop {
            let mut next: Option<(usize, u64)> = None;
            {
                let inner = this.ctx.inner.lock().expect("ctx lock");
                for (i, child) in this.children.iter().enumerate() {
                    if this.resolved[i].is_some() {
                        continue;
                    }
                    if let Some(completion_id) = child.pending_completion_id(&inner) {
                        if can_consume_completion(&inner, completion_id)
                            && next.is_none_or(|(_, best)| completion_id < best)
                        {
                            next = Some((i, completion_id));
                        }
                    }
                }
            }
            let Some((idx, completion_id)) = next else { break };
            match Pin::new(&mut this.children[idx]).poll(cx) {
                Poll::Ready(output) => this.resolved[idx] = Some((completion_id, output)),
                Poll::Pending => unreachable!("join child was consumable"),
            }
        }

        if this.resolved.iter().all(Option::is_some) {
            let mut items: Vec<(u64, DurableOutput)> = this.resolved.iter_mut().map(|r| r.take().expect("resolved")).collect();
            items.sort_by_key(|(id, _)| *id);
            Poll::Ready(items.into_iter().map(|(_, out)| out).collect())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_gate_blocks_unconsumed_earlier_completion() {
        let ctx = OrchestrationContext::new(
            "i",
            "o",
            0,
            0,
            None,
            vec![
                Event::OrchestrationStarted {
                    event_id: 1,
                    name: "o".into(),
                    input: String::new(),
                },
                Event::ActivityScheduled {
                    event_id: 2,
                    name: "A".into(),
                    input: String::new(),
                },
                Event::ActivityScheduled {
                    event_id: 3,
                    name: "B".into(),
                    input: String::new(),
                },
                Event::ActivityCompleted {
                    event_id: 4,
                    source_event_id: 2,
                    result: "a".into(),
                },
                Event::ActivityCompleted {
                    event_id: 5,
                    source_event_id: 3,
                    result: "b".into(),
                },
            ],
        );
        let inner = ctx.inner.lock().expect("lock");
        assert!(can_consume_completion(&inner, 4));
        assert!(!can_consume_completion(&inner, 5));
    }

    #[test]
    fn cancelled_source_unblocks_later_completion() {
        let ctx = OrchestrationContext::new(
            "i",
            "o",
            0,
            0,
            None,
            vec![
                Event::TimerCreated { event_id: 1, fire_at_ms: 10 },
                Event::ActivityScheduled {
                    event_id: 2,
                    name: "A".into(),
                    input: String::new(),
                },
                Event::TimerFired {
                    event_id: 3,
                    source_event_id: 1,
                    fire_at_ms: 10,
                },
                Event::ActivityCompleted {
                    event_id: 4,
                    source_event_id: 2,
                    result: "a".into(),
                },
            ],
        );
        let mut inner = ctx.inner.lock().expect("lock");
        assert!(!can_consume_completion(&inner, 4));
        inner.cancelled_source_ids.insert(1);
        assert!(can_consume_completion(&inner, 4));
    }
}
