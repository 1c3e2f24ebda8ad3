//! Prometheus metrics instrumentation for tubeq.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `tubeq_jobs_enqueued_total` - Jobs accepted by the broker, per tube
//! - `tubeq_jobs_dispatched_total` - Dispatch outcomes, per tube and outcome
//! - `tubeq_broker_errors_total` - Broker call failures, per operation
//!
//! ## Histograms
//! - `tubeq_handler_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for tubeq metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `tube`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tubeq_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["tube"]).expect("tubeq_jobs_enqueued_total metric creation failed")
});

/// Labels: `tube`, `outcome` (completed, discarded, released, buried).
pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tubeq_jobs_dispatched_total",
        "Total number of reserved jobs driven to an outcome",
    );
    CounterVec::new(opts, &["tube", "outcome"])
        .expect("tubeq_jobs_dispatched_total metric creation failed")
});

/// Labels: `operation`.
pub static BROKER_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tubeq_broker_errors_total", "Total number of failed broker calls");
    CounterVec::new(opts, &["operation"]).expect("tubeq_broker_errors_total metric creation failed")
});

/// Labels: `tube`, `outcome`.
pub static HANDLER_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "tubeq_handler_duration_seconds",
        "Handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["tube", "outcome"])
        .expect("tubeq_handler_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_DISPATCHED_TOTAL.clone()),
        Box::new(BROKER_ERRORS_TOTAL.clone()),
        Box::new(HANDLER_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(tube: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[tube]).inc();
}

pub fn record_dispatch_outcome(tube: &str, outcome: &str) {
    JOBS_DISPATCHED_TOTAL.with_label_values(&[tube, outcome]).inc();
}

pub fn record_broker_error(operation: &str) {
    BROKER_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn observe_handler_duration(tube: &str, outcome: &str, duration_secs: f64) {
    HANDLER_DURATION_SECONDS
        .with_label_values(&[tube, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).map_err(Into::into)
}
