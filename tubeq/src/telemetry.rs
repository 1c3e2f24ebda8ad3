//! Tracing and telemetry instrumentation for tubeq.
//!
//! Spans for the enqueue, dispatch and escalation paths, `record_*` helpers
//! that log and (with the `metrics` feature) count lifecycle events, the
//! debug audit channel, and subscriber installation.
//!
//! # Example
//!
//! ```ignore
//! use tubeq::telemetry::{init_tracing, job_dispatch_span};
//!
//! init_tracing(&config.logging)?;
//! let span = job_dispatch_span(job_id.to_string(), "MAIL");
//! let _enter = span.enter();
//! ```

use std::future::Future;

use serde::Serialize;
use tracing::{info_span, Instrument, Level, Span};
use tracing_subscriber::EnvFilter;

use crate::config::{LoggingConfig, ServiceConfig};
use crate::job::JobId;

/// Target used for audit records.
pub const AUDIT_TARGET: &str = "tubeq::audit";

/// Create a tracing span for an enqueue.
#[must_use]
pub fn job_enqueue_span(tube: impl AsRef<str>, delay_secs: u32) -> Span {
    info_span!(
        "tubeq.enqueue",
        tube = %tube.as_ref(),
        delay_secs = delay_secs,
    )
}

/// Create a tracing span for processing one reserved job.
#[must_use]
pub fn job_dispatch_span(job_id: impl AsRef<str>, tube: impl AsRef<str>) -> Span {
    info_span!(
        "tubeq.dispatch",
        job_id = %job_id.as_ref(),
        tube = %tube.as_ref(),
    )
}

/// Create a tracing span for a retry escalation.
#[must_use]
pub fn job_escalate_span(job_id: impl AsRef<str>, reserve_count: u32) -> Span {
    info_span!(
        "tubeq.escalate",
        job_id = %job_id.as_ref(),
        reserve_count = reserve_count,
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    tube: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_dispatch_span(job_id, tube))
}

pub fn record_job_enqueued(job_id: JobId, tube: impl AsRef<str>) {
    tracing::info!(job_id = %job_id, tube = %tube.as_ref(), "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(tube.as_ref());
}

/// Record the terminal outcome of one dispatch.
///
/// `outcome` is one of `completed`, `discarded`, `released`, `buried`.
pub fn record_dispatch_outcome(job_id: JobId, tube: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id,
        tube = %tube.as_ref(),
        outcome = %outcome.as_ref(),
        "job dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_dispatch_outcome(tube.as_ref(), outcome.as_ref());
}

pub fn record_broker_error(operation: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(operation, error = %error, "broker call failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_broker_error(operation);
}

/// Start timing a handler invocation.
pub fn record_handler_start(job_id: JobId) -> HandlerTimingHandle {
    HandlerTimingHandle {
        job_id,
        start: std::time::Instant::now(),
    }
}

/// Finish timing a handler invocation.
pub fn record_handler_end(handle: HandlerTimingHandle, tube: impl AsRef<str>, outcome: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = %handle.job_id,
        tube = %tube.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "handler finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_handler_duration(tube.as_ref(), outcome.as_ref(), duration_secs);
}

/// Handle returned by [`record_handler_start`].
#[derive(Debug)]
pub struct HandlerTimingHandle {
    job_id: JobId,
    start: std::time::Instant,
}

impl HandlerTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Debug audit channel: one record per enqueue or dispatch outcome, carrying
/// the job id, a message and the envelope. Disabled unless `debug` is set.
///
/// Recording is best-effort; a body that cannot be rendered is replaced by a
/// placeholder and never fails the caller.
#[derive(Clone, Copy, Debug)]
pub struct AuditLog {
    enabled: bool,
    level: Level,
}

impl AuditLog {
    pub fn new(enabled: bool, level: Level) -> Self {
        Self { enabled, level }
    }

    pub fn disabled() -> Self {
        Self::new(false, Level::INFO)
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.debug, config.audit_level())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record<T: Serialize + ?Sized>(&self, job_id: Option<JobId>, message: &str, body: Option<&T>) {
        if !self.enabled {
            return;
        }
        let job_id = job_id.map_or_else(|| "-".to_string(), |id| id.to_string());
        let body = match body {
            Some(body) => serde_json::to_string(body)
                .unwrap_or_else(|err| format!("<unrenderable body: {err}>")),
            None => "none".to_string(),
        };
        let level = self.level;
        if level == Level::ERROR {
            tracing::error!(target: AUDIT_TARGET, job_id = %job_id, body = %body, "{message}");
        } else if level == Level::WARN {
            tracing::warn!(target: AUDIT_TARGET, job_id = %job_id, body = %body, "{message}");
        } else if level == Level::INFO {
            tracing::info!(target: AUDIT_TARGET, job_id = %job_id, body = %body, "{message}");
        } else if level == Level::DEBUG {
            tracing::debug!(target: AUDIT_TARGET, job_id = %job_id, body = %body, "{message}");
        } else {
            tracing::trace!(target: AUDIT_TARGET, job_id = %job_id, body = %body, "{message}");
        }
    }
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Installing twice reports
/// an error rather than panicking.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
