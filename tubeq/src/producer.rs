use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use crate::broker::Broker;
use crate::config::ServiceConfig;
use crate::error::{QueueError, Result};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{Envelope, JobId, JobPriority, Payload, PushOptions};
use crate::registry::TubeRegistry;
use crate::telemetry::{job_enqueue_span, record_broker_error, record_job_enqueued, AuditLog};

/// Validates, wraps and enqueues outbound jobs.
///
/// Cheap to clone; any number of producers may share one broker connection
/// or use their own.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    registry: Arc<TubeRegistry>,
    defaults: PushOptions,
    audit: AuditLog,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("tubes", &self.registry.len())
            .field("defaults", &self.defaults)
            .field("audit", &self.audit)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<TubeRegistry>) -> Self {
        Self {
            broker,
            registry,
            defaults: PushOptions::default(),
            audit: AuditLog::disabled(),
            events: None,
        }
    }

    /// Producer with priority, ttr and audit settings taken from `config`.
    pub fn from_config(
        broker: Arc<dyn Broker>,
        registry: Arc<TubeRegistry>,
        config: &ServiceConfig,
    ) -> Self {
        let defaults = PushOptions::default()
            .with_priority(config.default_priority())
            .with_ttr(config.default_ttr_secs);
        Self::new(broker, registry)
            .with_defaults(defaults)
            .with_audit(AuditLog::from_config(config))
    }

    pub fn with_defaults(mut self, defaults: PushOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Options applied by [`push_default`](Self::push_default).
    pub fn defaults(&self) -> PushOptions {
        self.defaults
    }

    pub fn registry(&self) -> &TubeRegistry {
        &self.registry
    }

    /// Enqueue `payload` on the tube named by `tag` with the default
    /// delay, priority and ttr.
    pub async fn push_default<T: Serialize + ?Sized>(&self, tag: &str, payload: &T) -> Result<JobId> {
        self.push(tag, payload, self.defaults).await
    }

    /// Enqueue `payload` on the tube named by `tag`.
    ///
    /// Fails with [`QueueError::UnknownTube`] or [`QueueError::EmptyPayload`]
    /// before any broker call when the tag has no registration or the payload
    /// does not serialize to a non-empty object.
    pub async fn push<T: Serialize + ?Sized>(
        &self,
        tag: &str,
        payload: &T,
        options: PushOptions,
    ) -> Result<JobId> {
        let tube = self.registry.resolve(tag)?.name.clone();
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Err(QueueError::EmptyPayload(tube)),
        };
        self.put_envelope(tube, payload, options).await
    }

    async fn put_envelope(&self, tube: String, payload: Payload, options: PushOptions) -> Result<JobId> {
        let envelope = Envelope::new(tube.clone(), payload);
        let body = envelope.encode()?;

        let id = async {
            self.broker
                .put(&tube, &body, options.priority, options.delay_secs, options.ttr_secs)
                .await
                .inspect_err(|err| record_broker_error("put", err))
        }
        .instrument(job_enqueue_span(&tube, options.delay_secs))
        .await?;

        record_job_enqueued(id, &tube);
        self.audit.record(Some(id), "job enqueued", Some(&envelope));
        self.publish(id, &tube, options.priority, options.delay_secs).await;
        Ok(id)
    }

    async fn publish(&self, id: JobId, tube: &str, priority: JobPriority, delay_secs: u32) {
        let Some(events) = &self.events else {
            return;
        };
        let event = JobEvent::new(
            id,
            Some(tube.to_string()),
            JobEventPayload::Enqueued { priority, delay_secs },
        );
        if let Err(err) = events.publish(event).await {
            tracing::warn!(job_id = %id, "failed to publish enqueue event: {err}");
        }
    }
}
