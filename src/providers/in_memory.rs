//! In-memory provider: the reference implementation of the storage
//! contract, used by fast tests. Same semantics as the SQLite provider
//! (per-instance lease, delayed visibility, atomic ack) minus durability.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, InstanceSnapshot, InstanceStatus, OrchestrationItem, Provider, ProviderError, WorkItem,
    now_millis,
};
use crate::Event;
use async_trait::async_trait;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug)]
struct InstanceRow {
    orchestration: String,
    status: InstanceStatus,
    output: Option<String>,
    custom_status: Option<String>,
    custom_status_version: u64,
    history: Vec<Event>,
    lock_token: Option<String>,
    locked_until_ms: u64,
}

#[derive(Debug)]
struct QueuedMessage {
    item: WorkItem,
    visible_at_ms: u64,
}

#[derive(Debug)]
struct ClaimedBatch {
    instance: String,
    messages: Vec<WorkItem>,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRow>,
    orchestrator_q: Vec<QueuedMessage>,
    claimed: HashMap<String, ClaimedBatch>,
    worker_q: Vec<WorkItem>,
    worker_invisible: HashMap<String, WorkItem>,
    timer_q: Vec<WorkItem>,
    timer_invisible: HashMap<String, WorkItem>,
    token_seq: u64,
}

impl State {
    fn next_token(&mut self, prefix: &str) -> String {
        self.token_seq += 1;
        format!("{prefix}:{}", self.token_seq)
    }

    /// Return expired claims' messages to the queue so another worker can
    /// pick the instance up; their stale tokens become permanent errors.
    fn expire_stale_claims(&mut self, now: u64) {
        let expired: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, row)| row.lock_token.is_some() && row.locked_until_ms < now)
            .map(|(id, _)| id.clone())
            .collect();
        for instance in expired {
            if let Some(row) = self.instances.get_mut(&instance) {
                if let Some(token) = row.lock_token.take() {
                    if let Some(batch) = self.claimed.remove(&token) {
                        for (i, item) in batch.messages.into_iter().enumerate() {
                            self.orchestrator_q.insert(i, QueuedMessage { item, visible_at_ms: now });
                        }
                    }
                }
                row.locked_until_ms = 0;
            }
        }
    }
}

/// Volatile provider backed by tokio-mutexed maps.
pub struct InMemoryProvider {
    state: Mutex<State>,
    lock_timeout_ms: u64,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl InMemoryProvider {
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_timeout_ms: lock_timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.get(instance).map(|r| r.history.clone()).unwrap_or_default())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceSnapshot>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.get(instance).map(|row| InstanceSnapshot {
            instance: instance.to_string(),
            orchestration: row.orchestration.clone(),
            status: row.status,
            output: row.output.clone(),
            custom_status: row.custom_status.clone(),
            custom_status_version: row.custom_status_version,
        }))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.keys().cloned().collect())
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if let WorkItem::StartOrchestration { instance, orchestration, .. } = &item {
            if state.instances.contains_key(instance) {
                return Err(ProviderError::permanent(
                    "enqueue_orchestrator_work",
                    format!("instance already exists: {instance}"),
                ));
            }
            state.instances.insert(
                instance.clone(),
                InstanceRow {
                    orchestration: orchestration.clone(),
                    status: InstanceStatus::Pending,
                    output: None,
                    custom_status: None,
                    custom_status_version: 0,
                    history: Vec::new(),
                    lock_token: None,
                    locked_until_ms: 0,
                },
            );
        }
        let visible_at_ms = now_millis()
            .saturating_add(visible_in.map(|d| d.as_millis().min(u64::MAX as u128) as u64).unwrap_or(0));
        state.orchestrator_q.push(QueuedMessage { item, visible_at_ms });
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        state.expire_stale_claims(now);

        // First visible message whose instance exists and is unleased
        // decides which instance we claim.
        let chosen = state.orchestrator_q.iter().find_map(|m| {
            if m.visible_at_ms > now {
                return None;
            }
            let row = state.instances.get(m.item.instance())?;
            if row.lock_token.is_some() {
                return None;
            }
            Some(m.item.instance().to_string())
        })?;

        let mut messages = Vec::new();
        let mut rest = Vec::new();
        for m in state.orchestrator_q.drain(..) {
            if m.item.instance() == chosen && m.visible_at_ms <= now {
                messages.push(m.item);
            } else {
                rest.push(m);
            }
        }
        state.orchestrator_q = rest;

        let token = state.next_token("orch");
        state.claimed.insert(
            token.clone(),
            ClaimedBatch {
                instance: chosen.clone(),
                messages: messages.clone(),
            },
        );
        let lock_timeout = self.lock_timeout_ms;
        let row = state.instances.get_mut(&chosen)?;
        row.lock_token = Some(token.clone());
        row.locked_until_ms = now.saturating_add(lock_timeout);
        if !row.status.is_terminal() {
            row.status = InstanceStatus::Running;
        }
        let history = row.history.clone();

        Some(OrchestrationItem {
            instance: chosen,
            history,
            messages,
            lock_token: token,
        })
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let batch = state.claimed.remove(lock_token).ok_or_else(|| {
            ProviderError::permanent("ack_orchestration_item", format!("stale or unknown lock token: {lock_token}"))
        })?;
        let row = state.instances.get_mut(&batch.instance).ok_or_else(|| {
            ProviderError::permanent("ack_orchestration_item", format!("instance not found: {}", batch.instance))
        })?;

        row.history.extend(history_delta);
        if let Some(status) = metadata.status {
            if !row.status.is_terminal() {
                row.status = status;
            }
        }
        if let Some(output) = metadata.output {
            row.output = Some(output);
        }
        if let Some(view) = metadata.custom_status {
            row.custom_status = view;
        }
        row.custom_status_version += metadata.custom_status_bumps;
        row.lock_token = None;
        row.locked_until_ms = 0;

        state.worker_q.extend(worker_items);
        state.timer_q.extend(timer_items);
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let Some(batch) = state.claimed.remove(lock_token) else {
            // Already expired or acked; abandoning twice is harmless.
            return Ok(());
        };
        let visible_at_ms = now_millis()
            .saturating_add(delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64).unwrap_or(0));
        for (i, item) in batch.messages.into_iter().enumerate() {
            state.orchestrator_q.insert(i, QueuedMessage { item, visible_at_ms });
        }
        if let Some(row) = state.instances.get_mut(&batch.instance) {
            row.lock_token = None;
            row.locked_until_ms = 0;
            if row.status == InstanceStatus::Running {
                row.status = InstanceStatus::Suspended;
            }
        }
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        if state.worker_q.is_empty() {
            return None;
        }
        let item = state.worker_q.remove(0);
        let token = state.next_token("work");
        state.worker_invisible.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.worker_invisible.remove(token);
        Ok(())
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.worker_invisible.remove(token) {
            state.worker_q.insert(0, item);
        }
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        if state.timer_q.is_empty() {
            return None;
        }
        let item = state.timer_q.remove(0);
        let token = state.next_token("timer");
        state.timer_invisible.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.timer_invisible.remove(token);
        Ok(())
    }

    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.timer_invisible.remove(token) {
            state.timer_q.insert(0, item);
        }
        Ok(())
    }
}
