//! Control-plane client.
//!
//! Communicates with the runtime exclusively through the shared provider:
//! starting an instance and raising an event are enqueue operations;
//! status queries read the instance snapshot the runtime maintains.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::codec::Json;
use crate::providers::{Provider, ProviderError, WorkItem, now_millis};
use crate::runtime::OrchestrationStatus;
use crate::Event;

/// Errors from control-plane operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The instance id is unknown.
    NotFound(String),
    /// The operation is invalid for the instance's current state, e.g.
    /// raising an event against a terminal instance.
    InvalidState(String),
    /// An instance with this id already exists.
    AlreadyExists(String),
    Store(ProviderError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound(instance) => write!(f, "instance not found: {instance}"),
            ClientError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            ClientError::AlreadyExists(instance) => write!(f, "instance already exists: {instance}"),
            ClientError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Store(e)
    }
}

/// Errors from [`Client::wait_for_orchestration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for orchestration"),
            WaitError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Thin client bound to a provider.
pub struct Client {
    store: Arc<dyn Provider>,
    id_seq: AtomicU64,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self {
            store,
            id_seq: AtomicU64::new(0),
        }
    }

    /// Schedule a new orchestration instance under the given id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        if self.store.get_instance(instance).await?.is_some() {
            return Err(ClientError::AlreadyExists(instance.to_string()));
        }
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await.map_err(|e| {
            // Provider-level duplicate check backstops the racy lookup above.
            if !e.is_retryable() && e.message.contains("already exists") {
                ClientError::AlreadyExists(instance.to_string())
            } else {
                ClientError::Store(e)
            }
        })
    }

    /// Schedule a new instance under a generated id and return it.
    pub async fn start_orchestration_auto(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let instance = format!("{}-{}-{}", orchestration.to_lowercase(), now_millis(), seq);
        self.start_orchestration(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Typed start: the input is serialized through the JSON codec.
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload =
            Json::encode(input).map_err(|e| ClientError::InvalidState(format!("encode input: {e}")))?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Raise an external event into a running or suspended instance.
    ///
    /// Raising against an unknown instance is [`ClientError::NotFound`];
    /// against a terminal instance it is [`ClientError::InvalidState`];
    /// terminal histories are immutable, so silently accepting the event
    /// would just lose it.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        let snapshot = self
            .store
            .get_instance(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))?;
        if snapshot.status.is_terminal() {
            return Err(ClientError::InvalidState(format!(
                "instance {instance} is {}",
                snapshot.status.as_str()
            )));
        }
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.into(),
            data: data.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await?;
        Ok(())
    }

    /// Typed raise: the payload is serialized through the JSON codec.
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: &T,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(data).map_err(|e| ClientError::InvalidState(format!("encode event: {e}")))?;
        self.raise_event(instance, event_name, payload).await
    }

    /// Project the instance's current status. Safe to call at any time.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let Some(snapshot) = self.store.get_instance(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        use crate::providers::InstanceStatus;
        Ok(match snapshot.status {
            InstanceStatus::Pending | InstanceStatus::Running => OrchestrationStatus::Running {
                custom_status: snapshot.custom_status,
            },
            InstanceStatus::Suspended => OrchestrationStatus::Suspended {
                custom_status: snapshot.custom_status,
            },
            InstanceStatus::Completed => OrchestrationStatus::Completed {
                output: snapshot.output.unwrap_or_default(),
                custom_status: snapshot.custom_status,
            },
            InstanceStatus::Failed => OrchestrationStatus::Failed {
                error: snapshot.output.unwrap_or_default(),
                custom_status: snapshot.custom_status,
            },
        })
    }

    /// Poll until the instance reaches a terminal status or `timeout`
    /// elapses. A not-yet-visible instance keeps polling, since its start may
    /// still be queued.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self
                .get_orchestration_status(instance)
                .await
                .map_err(|e| WaitError::Other(e.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Full event history, for auditing and tests.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        if self.store.get_instance(instance).await?.is_none() {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        Ok(self.store.read(instance).await?)
    }
}
