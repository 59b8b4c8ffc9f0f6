//! A single dispatch turn of one instance: convert queued messages into
//! completion events, replay the orchestration against the augmented
//! history, and derive the delta to commit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::runtime::registry::OrchestrationHandler;
use crate::{Action, Event};

/// Outcome of executing a turn.
#[derive(Debug)]
pub enum TurnResult {
    /// Orchestration is suspended on at least one pending awaitable.
    Continue,
    Completed(String),
    Failed(String),
}

pub struct OrchestrationTurn {
    instance: String,
    turn_index: u64,
    baseline_history: Vec<Event>,
    history_delta: Vec<Event>,
    pending_actions: Vec<Action>,
    next_event_id: u64,
    nondet_error: Option<String>,
    /// Custom-status update to persist, if the turn wrote one.
    custom_status_update: Option<Option<String>>,
    custom_status_bumps: u64,
}

impl OrchestrationTurn {
    pub fn new(instance: impl Into<String>, turn_index: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        Self {
            instance: instance.into(),
            turn_index,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            nondet_error: None,
            custom_status_update: None,
            custom_status_bumps: 0,
        }
    }

    fn push_event(&mut self, mut event: Event) {
        event.set_event_id(self.next_event_id);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    fn schedule_kind(&self, id: u64) -> Option<&'static str> {
        for e in self.baseline_history.iter().chain(self.history_delta.iter()) {
            match e {
                Event::ActivityScheduled { event_id, .. } if *event_id == id => return Some("activity"),
                Event::TimerCreated { event_id, .. } if *event_id == id => return Some("timer"),
                Event::ExternalSubscribed { event_id, .. } if *event_id == id => return Some("external"),
                _ => {}
            }
        }
        None
    }

    fn completion_already_recorded(&self, msg: &WorkItem) -> bool {
        let events = self.baseline_history.iter().chain(self.history_delta.iter());
        match msg {
            WorkItem::ActivityCompleted { id, .. } | WorkItem::ActivityFailed { id, .. } => {
                events.into_iter().any(|e| {
                    matches!(e, Event::ActivityCompleted { source_event_id, .. } if source_event_id == id)
                        || matches!(e, Event::ActivityFailed { source_event_id, .. } if source_event_id == id)
                })
            }
            WorkItem::TimerFired { id, .. } => events
                .into_iter()
                .any(|e| matches!(e, Event::TimerFired { source_event_id, .. } if source_event_id == id)),
            WorkItem::ExternalRaised { name, data, .. } => events.into_iter().any(
                |e| matches!(e, Event::ExternalEvent { name: n, data: d, .. } if n == name && d == data),
            ),
            _ => false,
        }
    }

    fn has_subscription(&self, name: &str) -> bool {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
    }

    /// Stage 1: turn queued messages into completion events.
    ///
    /// Filtering rules: duplicates (at-least-once queue delivery) are
    /// dropped; completions with no matching schedule, or whose schedule
    /// has the wrong kind, flag non-determinism; external raises with no
    /// subscription are dropped with a warning.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        for msg in messages {
            if self.completion_already_recorded(msg) {
                warn!(instance = %self.instance, kind = msg.kind(), "dropping duplicate completion");
                continue;
            }

            match msg {
                WorkItem::StartOrchestration { .. } => {
                    // Consumed by the scheduler before completion prep; the
                    // started event is already staged.
                }
                WorkItem::ActivityCompleted { id, result, .. } => match self.schedule_kind(*id) {
                    Some("activity") => self.push_event(Event::ActivityCompleted {
                        event_id: 0,
                        source_event_id: *id,
                        result: result.clone(),
                    }),
                    other => self.flag_completion_mismatch("activity", *id, other),
                },
                WorkItem::ActivityFailed { id, error, .. } => match self.schedule_kind(*id) {
                    Some("activity") => self.push_event(Event::ActivityFailed {
                        event_id: 0,
                        source_event_id: *id,
                        error: error.clone(),
                    }),
                    other => self.flag_completion_mismatch("activity", *id, other),
                },
                WorkItem::TimerFired { id, fire_at_ms, .. } => match self.schedule_kind(*id) {
                    Some("timer") => self.push_event(Event::TimerFired {
                        event_id: 0,
                        source_event_id: *id,
                        fire_at_ms: *fire_at_ms,
                    }),
                    other => self.flag_completion_mismatch("timer", *id, other),
                },
                WorkItem::ExternalRaised { name, data, .. } => {
                    if self.has_subscription(name) {
                        self.push_event(Event::ExternalEvent {
                            event_id: 0,
                            name: name.clone(),
                            data: data.clone(),
                        });
                    } else {
                        warn!(instance = %self.instance, event = %name, "dropping external event with no subscription");
                    }
                }
                WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. } => {
                    warn!(instance = %self.instance, kind = msg.kind(), "unexpected work item on orchestrator queue");
                }
            }
        }

        debug!(
            instance = %self.instance,
            turn_index = self.turn_index,
            completion_events = self.history_delta.len(),
            "completion events staged"
        );
    }

    fn flag_completion_mismatch(&mut self, expected: &str, id: u64, found: Option<&'static str>) {
        let err = match found {
            Some(kind) => format!(
                "nondeterministic: completion kind mismatch for id={id}: schedule is '{kind}', completion is '{expected}'"
            ),
            None => format!("nondeterministic: no matching schedule for {expected} completion id={id}"),
        };
        warn!(instance = %self.instance, error = %err, "nondeterminism in completion batch");
        if self.nondet_error.is_none() {
            self.nondet_error = Some(err);
        }
    }

    /// Stage 2: replay the orchestration against baseline + staged
    /// completions and collect the turn's decisions.
    pub fn execute(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        orchestration_name: &str,
        input: String,
        wall_now_ms: u64,
        custom_status_seed: Option<String>,
    ) -> TurnResult {
        if let Some(err) = self.nondet_error.clone() {
            return self.fail(err);
        }

        let mut working_history = self.baseline_history.clone();
        working_history.extend(self.history_delta.iter().cloned());
        let working_len = working_history.len();

        let instance = self.instance.clone();
        let name = orchestration_name.to_string();
        let turn_index = self.turn_index;
        let run = catch_unwind(AssertUnwindSafe(move || {
            crate::run_turn(
                instance,
                name,
                turn_index,
                wall_now_ms,
                custom_status_seed,
                working_history,
                input,
                move |ctx, input| {
                    let h = handler.clone();
                    async move { h.invoke(ctx, input).await }
                },
            )
        }));

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    format!("orchestration panicked: {s}")
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    format!("orchestration panicked: {s}")
                } else {
                    "orchestration panicked".to_string()
                };
                return self.fail(msg);
            }
        };

        if outcome.history.len() > working_len {
            self.history_delta.extend(outcome.history[working_len..].iter().cloned());
            self.next_event_id = self
                .history_delta
                .last()
                .map(|e| e.event_id() + 1)
                .unwrap_or(self.next_event_id);
        }
        self.pending_actions = outcome.actions;
        if outcome.custom_status_writes > 0 {
            self.custom_status_update = Some(outcome.custom_status);
            self.custom_status_bumps = outcome.custom_status_writes;
        }

        if let Some(err) = outcome.nondeterminism {
            return self.fail(err);
        }

        match outcome.output {
            Some(Ok(output)) => {
                self.push_event(Event::OrchestrationCompleted {
                    event_id: 0,
                    output: output.clone(),
                });
                TurnResult::Completed(output)
            }
            Some(Err(error)) => self.fail(error),
            None => TurnResult::Continue,
        }
    }

    /// Record a terminal failure event and return the matching result.
    pub fn fail(&mut self, error: String) -> TurnResult {
        // Dispatching actions recorded before the failure would leak side
        // effects for an instance that is already dead.
        self.pending_actions.clear();
        self.push_event(Event::OrchestrationFailed {
            event_id: 0,
            error: error.clone(),
        });
        TurnResult::Failed(error)
    }

    pub fn push_started_event(&mut self, orchestration: &str, input: &str) {
        self.push_event(Event::OrchestrationStarted {
            event_id: 0,
            name: orchestration.to_string(),
            input: input.to_string(),
        });
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn take_history_delta(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.history_delta)
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn custom_status_update(&self) -> (Option<Option<String>>, u64) {
        (self.custom_status_update.clone(), self.custom_status_bumps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline_with_schedule() -> Vec<Event> {
        vec![
            Event::OrchestrationStarted {
                event_id: 1,
                name: "T".into(),
                input: String::new(),
            },
            Event::ActivityScheduled {
                event_id: 2,
                name: "A".into(),
                input: "x".into(),
            },
        ]
    }

    #[test]
    fn completion_with_matching_schedule_becomes_event() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline_with_schedule());
        turn.prep_completions(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 2,
            result: "ok".into(),
        }]);
        assert_eq!(turn.history_delta().len(), 1);
        assert!(matches!(
            turn.history_delta()[0],
            Event::ActivityCompleted { event_id: 3, source_event_id: 2, .. }
        ));
    }

    #[test]
    fn duplicate_completion_is_dropped() {
        let mut baseline = baseline_with_schedule();
        baseline.push(Event::ActivityCompleted {
            event_id: 3,
            source_event_id: 2,
            result: "ok".into(),
        });
        let mut turn = OrchestrationTurn::new("i", 2, baseline);
        turn.prep_completions(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 2,
            result: "ok".into(),
        }]);
        assert!(turn.history_delta().is_empty());
    }

    #[test]
    fn completion_without_schedule_flags_nondeterminism() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline_with_schedule());
        turn.prep_completions(&[WorkItem::TimerFired {
            instance: "i".into(),
            id: 99,
            fire_at_ms: 0,
        }]);
        assert!(turn.nondet_error.as_deref().is_some_and(|e| e.contains("no matching schedule")));
    }

    #[test]
    fn external_without_subscription_is_dropped() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline_with_schedule());
        turn.prep_completions(&[WorkItem::ExternalRaised {
            instance: "i".into(),
            name: "Approval".into(),
            data: "{}".into(),
        }]);
        assert!(turn.history_delta().is_empty());
    }
}
