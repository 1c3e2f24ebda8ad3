use serde_json::Value;
use std::sync::Arc;
use tubeq::*;

use crate::{InMemoryBroker, MockHandler};

/// Unwrap a `json!` object literal into a payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload fixture must be an object, got {other}"),
    }
}

/// Raw job body carrying an envelope for `tag`.
pub fn envelope_body(tag: &str, data: Value) -> Vec<u8> {
    Envelope::new(tag, payload(data))
        .encode()
        .expect("fixture envelope encodes")
}

/// An in-memory broker plus a registry of mock handlers, one tube per
/// handler. The consumer registered for tube `T` is named `T-consumer`.
pub struct TestHarness {
    pub broker: InMemoryBroker,
    pub registry: Arc<TubeRegistry>,
    pub config: ServiceConfig,
}

impl TestHarness {
    pub fn new(tubes: &[(&str, MockHandler)]) -> Self {
        let mut config = ServiceConfig::default();
        config.debug = false;
        config.reserve_timeout_secs = 0;
        let mut catalog = HandlerCatalog::new();
        for (tube, handler) in tubes {
            let consumer = format!("{tube}-consumer");
            config
                .tubes
                .insert(tube.to_string(), TubeConfig::new(&consumer, format!("{tube} jobs")));
            catalog = catalog.register(consumer, handler.clone());
        }
        let registry = TubeRegistry::from_config(&config, &catalog).expect("fixture registry builds");
        Self {
            broker: InMemoryBroker::new(),
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn with_plot(mut self, plot: Vec<u32>) -> Self {
        self.config.plot = plot;
        self
    }

    pub fn broker_arc(&self) -> Arc<dyn Broker> {
        Arc::new(self.broker.clone())
    }

    pub fn producer(&self) -> Producer {
        Producer::from_config(self.broker_arc(), self.registry.clone(), &self.config)
    }

    pub fn admin(&self) -> AdminFacade {
        AdminFacade::from_config(self.broker_arc(), self.registry.clone(), &self.config)
    }

    /// Builder seeded from the harness config, with broker and registry set.
    pub fn dispatcher_builder(&self) -> ConsumerDispatcherBuilder {
        ConsumerDispatcherBuilder::from_config(&self.config)
            .expect("fixture config is valid")
            .with_broker(self.broker_arc())
            .with_registry(self.registry.clone())
            .with_worker_config(WorkerConfig::new("test-dispatcher").with_reserve_timeout(0).with_error_backoff(10))
    }

    pub fn dispatcher(&self) -> ConsumerDispatcher {
        self.dispatcher_builder().build().expect("fixture dispatcher builds")
    }
}
