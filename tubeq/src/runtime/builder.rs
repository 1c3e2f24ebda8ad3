use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::config::{normalize_tube, ServiceConfig};
use crate::error::{QueueError, Result};
use crate::events::JobEventPublisher;
use crate::job::PushOptions;
use crate::registry::TubeRegistry;
use crate::retry::RetryPolicy;
use crate::telemetry::AuditLog;

use super::supervisor::{ConsumerDispatcher, PoisonRoute, ShutdownToken};
use super::worker::WorkerConfig;

/// Builder for a [`ConsumerDispatcher`] with explicit collaborators.
///
/// `build` fails unless a broker and a registry are set and every watched
/// tube is registered with a bound handler.
///
/// # Example
///
/// ```ignore
/// use tubeq::*;
///
/// let dispatcher = ConsumerDispatcherBuilder::from_config(&config)?
///     .with_broker(broker)
///     .with_registry(registry)
///     .build()?;
/// ```
pub struct ConsumerDispatcherBuilder {
    broker: Option<Arc<dyn Broker>>,
    registry: Option<Arc<TubeRegistry>>,
    retry: Option<RetryPolicy>,
    watch: Option<BTreeSet<String>>,
    ignore_default_tube: bool,
    poison_tube: Option<String>,
    poison_options: PushOptions,
    worker: WorkerConfig,
    audit: AuditLog,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl fmt::Debug for ConsumerDispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDispatcherBuilder")
            .field("broker_set", &self.broker.is_some())
            .field("registry_set", &self.registry.is_some())
            .field("retry", &self.retry)
            .field("watch", &self.watch)
            .field("ignore_default_tube", &self.ignore_default_tube)
            .field("poison_tube", &self.poison_tube)
            .field("worker", &self.worker)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl Default for ConsumerDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerDispatcherBuilder {
    pub fn new() -> Self {
        Self {
            broker: None,
            registry: None,
            retry: None,
            watch: None,
            ignore_default_tube: true,
            poison_tube: None,
            poison_options: PushOptions::default(),
            worker: WorkerConfig::default(),
            audit: AuditLog::disabled(),
            events: None,
        }
    }

    /// Seed retry plots, watch list, poison tube, audit and worker settings
    /// from `config`. Collaborators still have to be supplied.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let mut builder = Self::new()
            .with_retry_policy(RetryPolicy::from_config(config)?)
            .with_watch(config.watched_tubes())
            .with_ignore_default_tube(config.ignore_default_tube)
            .with_worker_config(WorkerConfig::from_config(config))
            .with_audit(AuditLog::from_config(config));
        builder.poison_options = PushOptions::default()
            .with_priority(config.default_priority())
            .with_ttr(config.default_ttr_secs);
        if let Some(poison) = &config.poison_tube {
            builder = builder.with_poison_tube(poison);
        }
        Ok(builder)
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_registry(mut self, registry: Arc<TubeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Tubes to watch. Defaults to every registered tube with a handler.
    pub fn with_watch<I, S>(mut self, tubes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.watch = Some(tubes.into_iter().map(|t| normalize_tube(t.as_ref())).collect());
        self
    }

    pub fn with_ignore_default_tube(mut self, ignore: bool) -> Self {
        self.ignore_default_tube = ignore;
        self
    }

    /// Copy poison messages into `tube` before deleting them.
    pub fn with_poison_tube(mut self, tube: impl AsRef<str>) -> Self {
        self.poison_tube = Some(normalize_tube(tube.as_ref()));
        self
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
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

    pub fn build(self) -> Result<ConsumerDispatcher> {
        let broker = self
            .broker
            .ok_or_else(|| QueueError::Config("dispatcher requires a broker".into()))?;
        let registry = self
            .registry
            .ok_or_else(|| QueueError::Config("dispatcher requires a tube registry".into()))?;

        let watch = match self.watch {
            Some(watch) => watch,
            None => registry
                .definitions()
                .filter(|d| d.handler().is_some())
                .map(|d| d.name.clone())
                .collect(),
        };
        if watch.is_empty() {
            return Err(QueueError::Config("dispatcher has no tubes to watch".into()));
        }
        for tube in &watch {
            if registry.resolve(tube)?.handler().is_none() {
                return Err(QueueError::HandlerMissing(tube.clone()));
            }
        }

        let poison = match self.poison_tube {
            Some(tube) if watch.contains(&tube) => {
                return Err(QueueError::Config(format!("poison tube `{tube}` must not be watched")));
            }
            Some(tube) => Some(PoisonRoute {
                tube,
                priority: self.poison_options.priority,
                ttr_secs: self.poison_options.ttr_secs,
            }),
            None => None,
        };

        Ok(ConsumerDispatcher {
            broker,
            registry,
            retry: self.retry.unwrap_or_default(),
            watch,
            ignore_default_tube: self.ignore_default_tube,
            poison,
            worker: self.worker,
            audit: self.audit,
            events: self.events,
            shutdown_token: ShutdownToken::new(),
            loop_handle: Mutex::new(None),
        })
    }
}
