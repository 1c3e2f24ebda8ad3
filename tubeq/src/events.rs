use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobPriority};

/// Metadata attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    /// Upper-cased tube name, when known.
    pub tube: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId, tube: Option<String>) -> Self {
        Self {
            version: 1,
            job_id,
            tube,
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, tube: Option<String>, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(job_id, tube),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.meta.job_id
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job accepted by the broker.
    Enqueued { priority: JobPriority, delay_secs: u32 },
    /// Job reserved by this dispatcher.
    Reserved,
    /// Handler succeeded; job deleted.
    Completed,
    /// Poison message removed without retry.
    Discarded { reason: String },
    /// Handler failed; job released for another attempt.
    Released { delay_secs: u32, reserve_count: u32 },
    /// Retries exhausted; job buried.
    Buried { reserve_count: u32 },
}

/// Trait for publishing job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged`; the publisher is
/// unaffected. With no subscribers, events are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Bus retaining up to `capacity` undelivered events per subscriber.
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event);
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe_job_events()
    }
}
