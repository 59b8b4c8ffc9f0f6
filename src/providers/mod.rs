//! Storage abstraction: the append-only history store plus the work
//! queues that drive dispatch.
//!
//! Providers are datastores only; the runtime owns all execution. The
//! contract that matters for correctness:
//!
//! - history is append-only and strictly ordered per instance;
//! - `fetch_orchestration_item` claims a per-instance lease, so at most
//!   one worker advances a given instance at a time;
//! - `ack_orchestration_item` commits the history delta, the downstream
//!   work items, and the instance metadata atomically, then releases the
//!   lease. A failed ack must leave no partial state behind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Event;

pub mod in_memory;
pub mod sqlite;

mod error;
pub use error::ProviderError;

/// Messages flowing between the client, the dispatchers, and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
        }
    }
}

/// Instance lifecycle as persisted by the provider.
///
/// `Pending` → created, never dispatched. `Running` → a worker holds the
/// lease. `Suspended` → released back to the store, waiting on at least
/// one pending awaitable. `Completed`/`Failed` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Running => "Running",
            InstanceStatus::Suspended => "Suspended",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(InstanceStatus::Pending),
            "Running" => Some(InstanceStatus::Running),
            "Suspended" => Some(InstanceStatus::Suspended),
            "Completed" => Some(InstanceStatus::Completed),
            "Failed" => Some(InstanceStatus::Failed),
            _ => None,
        }
    }
}

/// Point-in-time view of one instance's metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub instance: String,
    pub orchestration: String,
    pub status: InstanceStatus,
    /// Terminal result (output or serialized error), terminal states only.
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub custom_status_version: u64,
}

/// A claimed batch of orchestrator work for one instance: its full
/// history plus every message that was visible at claim time.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Metadata the runtime derived from a turn, applied atomically with the
/// history delta during ack.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    pub status: Option<InstanceStatus>,
    pub output: Option<String>,
    /// `Some(view)` when the turn wrote the custom status (including
    /// clearing it to `None`).
    pub custom_status: Option<Option<String>>,
    /// Number of custom-status writes observed this turn; bumps the
    /// persisted version counter.
    pub custom_status_bumps: u64,
}

/// Durable storage for instances, histories, and the three work queues.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Full history for an instance; empty when unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Metadata snapshot, or `None` for an unknown instance.
    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceSnapshot>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Enqueue a message for the orchestration dispatcher, optionally
    /// invisible for `visible_in` (used for durable timer firing).
    ///
    /// `StartOrchestration` also creates the instance row; starting an
    /// instance that already exists is a permanent error.
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Claim the next instance with visible messages: leases the instance,
    /// marks it `Running`, and returns its history plus the message batch.
    /// Returns `None` when no work is available.
    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem>;

    /// Commit a turn: append the history delta, enqueue downstream work,
    /// apply metadata, release the lease. Atomic; idempotence is keyed by
    /// the lock token (a stale token is a permanent error).
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release a claimed batch without committing; messages become
    /// visible again after `delay`.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError>;
    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError>;

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError>;
    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError>;
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
