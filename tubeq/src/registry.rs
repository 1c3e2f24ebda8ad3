//! Tube registry: tube name to handler and description.
//!
//! Built once at startup from [`ServiceConfig`] and a [`HandlerCatalog`] of
//! statically registered handlers, then shared read-only (behind `Arc`) by
//! the producer, dispatcher and admin facade. Lookups never lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::{normalize_tube, ServiceConfig};
use crate::error::{QueueError, Result};
use crate::handler::TubeHandler;

/// Handlers available to this process, keyed by the consumer name used in
/// configuration.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn TubeHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `consumer`. A later registration under the
    /// same name replaces the earlier one.
    pub fn register(mut self, consumer: impl Into<String>, handler: impl TubeHandler + 'static) -> Self {
        self.handlers.insert(consumer.into(), Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, consumer: impl Into<String>, handler: Arc<dyn TubeHandler>) -> Self {
        self.handlers.insert(consumer.into(), handler);
        self
    }

    pub fn get(&self, consumer: &str) -> Option<Arc<dyn TubeHandler>> {
        self.handlers.get(consumer).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerCatalog").field("consumers", &names).finish()
    }
}

/// A registered tube.
#[derive(Clone)]
pub struct TubeDefinition {
    /// Upper-cased tube name.
    pub name: String,
    /// Consumer name the handler was looked up by.
    pub consumer: String,
    pub description: String,
    handler: Option<Arc<dyn TubeHandler>>,
}

impl TubeDefinition {
    pub fn new(
        name: &str,
        consumer: impl Into<String>,
        description: impl Into<String>,
        handler: Option<Arc<dyn TubeHandler>>,
    ) -> Self {
        Self {
            name: normalize_tube(name),
            consumer: consumer.into(),
            description: description.into(),
            handler,
        }
    }

    /// The bound handler; `None` for producer-only registrations.
    pub fn handler(&self) -> Option<&Arc<dyn TubeHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for TubeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TubeDefinition")
            .field("name", &self.name)
            .field("consumer", &self.consumer)
            .field("description", &self.description)
            .field("handler_bound", &self.handler.is_some())
            .finish()
    }
}

/// Immutable mapping of normalized tube name to [`TubeDefinition`].
#[derive(Clone, Debug, Default)]
pub struct TubeRegistry {
    tubes: BTreeMap<String, TubeDefinition>,
}

impl TubeRegistry {
    /// Bind every configured tube to its handler from `catalog`.
    ///
    /// A watched tube whose consumer is missing from the catalog is a
    /// startup error. Unwatched tubes may stay unbound: this process can
    /// still produce to them.
    pub fn from_config(config: &ServiceConfig, catalog: &HandlerCatalog) -> Result<Self> {
        let watched = config.watched_tubes();
        let mut tubes = BTreeMap::new();
        for (name, tube) in &config.tubes {
            let handler = catalog.get(&tube.consumer);
            let key = normalize_tube(name);
            if handler.is_none() {
                if watched.contains(&key) {
                    return Err(QueueError::HandlerMissing(key));
                }
                tracing::debug!(tube = %key, consumer = %tube.consumer, "tube registered without handler");
            }
            Self::insert(&mut tubes, TubeDefinition::new(name, &tube.consumer, &tube.desc, handler))?;
        }
        Ok(Self { tubes })
    }

    /// Registrations without handlers, for producer-only processes.
    pub fn unbound(config: &ServiceConfig) -> Result<Self> {
        let mut tubes = BTreeMap::new();
        for (name, tube) in &config.tubes {
            Self::insert(&mut tubes, TubeDefinition::new(name, &tube.consumer, &tube.desc, None))?;
        }
        Ok(Self { tubes })
    }

    /// Assemble a registry from explicit definitions.
    pub fn from_definitions(definitions: impl IntoIterator<Item = TubeDefinition>) -> Result<Self> {
        let mut tubes = BTreeMap::new();
        for definition in definitions {
            Self::insert(&mut tubes, definition)?;
        }
        Ok(Self { tubes })
    }

    fn insert(tubes: &mut BTreeMap<String, TubeDefinition>, definition: TubeDefinition) -> Result<()> {
        if tubes.contains_key(&definition.name) {
            return Err(QueueError::Config(format!("tube `{}` registered twice", definition.name)));
        }
        tubes.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Look up `tag`, case-insensitively.
    pub fn resolve(&self, tag: &str) -> Result<&TubeDefinition> {
        self.get(tag)
            .ok_or_else(|| QueueError::UnknownTube(normalize_tube(tag)))
    }

    pub fn get(&self, tag: &str) -> Option<&TubeDefinition> {
        self.tubes.get(&normalize_tube(tag))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    pub fn description(&self, tag: &str) -> Option<&str> {
        self.get(tag).map(|d| d.description.as_str())
    }

    /// Normalized tube names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tubes.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TubeDefinition> {
        self.tubes.values()
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }
}
