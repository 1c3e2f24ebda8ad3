//! Tubeq - tube-routed delayed job queue over beanstalkd.
//!
//! A client and orchestrator for a FIFO-with-delay broker: producers enqueue
//! tagged jobs, a consumer dispatcher reserves them one at a time, routes each
//! to the handler registered for its tube and settles it by deleting,
//! releasing with a table-driven backoff, or burying it.
//!
//! # Core Concepts
//!
//! - **Broker**: The [`Broker`] trait is the call-level seam over the queue
//!   server; [`BeanstalkConnection`] implements it over TCP.
//!
//! - **Registry**: [`TubeRegistry`] maps upper-cased tube names to a
//!   [`TubeHandler`] and a description, built once from [`ServiceConfig`].
//!
//! - **Producer**: [`Producer::push`] validates a tag and payload, wraps them
//!   in an [`Envelope`] and puts the job on its tube.
//!
//! - **Dispatcher**: [`ConsumerDispatcher`] runs the reservation loop; see
//!   [`ConsumerDispatcherBuilder`].
//!
//! - **Retry**: [`RetryPolicy`] turns a job's reservation count into a delay
//!   from its [`RetryPlot`], or a burial once the plot is exhausted.
//!
//! - **Admin**: [`AdminFacade`] lists and inspects tubes, peeks jobs, and
//!   kicks or deletes them best-effort.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tubeq::*;
//!
//! let config = ServiceConfig::load("queue.toml")?;
//! let broker: Arc<dyn Broker> = Arc::new(BeanstalkConnection::connect(&config.host, config.port).await?);
//! let catalog = HandlerCatalog::new().register("MailSender", handler_fn(|payload| async move {
//!     send_mail(&payload).await?;
//!     Ok(HandlerOutcome::success())
//! }));
//! let registry = Arc::new(TubeRegistry::from_config(&config, &catalog)?);
//!
//! let producer = Producer::from_config(broker.clone(), registry.clone(), &config);
//! producer.push_default("mail", &serde_json::json!({ "to": "ops@example.com" })).await?;
//! ```

/// Operational queries: tube stats, peeks, manual kick and delete.
pub mod admin;

/// Beanstalkd text-protocol adapter implementing [`Broker`].
pub mod beanstalk;

/// The [`Broker`] trait: one method per broker primitive.
pub mod broker;

/// Service configuration loading and validation.
///
/// The `config` module defines [`ServiceConfig`], loaded once from TOML, YAML
/// or JSON with environment overrides.
pub mod config;

pub mod error;

/// Job lifecycle events and the in-process [`InProcEventBus`].
pub mod events;

/// The [`TubeHandler`] capability and its result type.
pub mod handler;

/// Job identifiers, priorities, states and the wire [`Envelope`].
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Enqueue path.
pub mod producer;

/// Tube name to handler and description.
pub mod registry;

/// Table-driven retry and burial policy.
pub mod retry;

/// The consumer dispatcher and its lifecycle.
///
/// Includes:
/// - [`ConsumerDispatcher`] - the reservation loop
/// - [`ConsumerDispatcherBuilder`] - validated construction
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - loop timing
pub mod runtime;

/// Typed broker statistics.
pub mod stats;

/// Tracing spans, audit records and subscriber setup.
pub mod telemetry;

pub use admin::*;
pub use beanstalk::{BeanstalkConnection, DEFAULT_PORT};
pub use broker::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use handler::*;
pub use job::*;
pub use producer::*;
pub use registry::*;
pub use retry::*;
pub use runtime::*;
pub use stats::*;
pub use telemetry::{init_tracing, AuditLog, AUDIT_TARGET};
