use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::config::{normalize_tube, ServiceConfig};
use crate::error::{QueueError, Result};
use crate::job::{JobId, JobPriority};
use crate::telemetry::job_escalate_span;
use tracing::Instrument;

/// Ordered backoff table in seconds. Entry `n` is the delay applied after a
/// failure on a job that had `n` previous reservations.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct RetryPlot(Vec<u32>);

impl RetryPlot {
    /// Build a plot; it must be non-empty and ascending.
    pub fn new(delays: Vec<u32>) -> Result<Self> {
        if delays.is_empty() {
            return Err(QueueError::Config("retry plot must not be empty".into()));
        }
        if delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(QueueError::Config(format!("retry plot must be ascending: {delays:?}")));
        }
        Ok(Self(delays))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Delay for the retry after `reserve_count` previous reservations, or
    /// `None` once the plot is exhausted.
    pub fn delay_for(&self, reserve_count: u32) -> Option<u32> {
        self.0.get(reserve_count as usize).copied()
    }
}

impl Default for RetryPlot {
    fn default() -> Self {
        Self(vec![10, 30, 60, 120])
    }
}

impl TryFrom<Vec<u32>> for RetryPlot {
    type Error = QueueError;

    fn try_from(value: Vec<u32>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RetryPlot> for Vec<u32> {
    fn from(value: RetryPlot) -> Self {
        value.0
    }
}

/// Whether a job with `reserve_count` previous reservations is out of
/// retries under a plot of length `plot_len`.
pub fn should_bury(reserve_count: u32, plot_len: usize) -> bool {
    reserve_count as usize >= plot_len
}

/// What to do with a job whose handler failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RetryDecision {
    /// Release the job back to the broker, delayed.
    Release { delay_secs: u32 },
    /// Bury the job; it waits for a manual kick.
    Bury,
}

/// Result of [`RetryPolicy::escalate`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Escalation {
    pub job_id: JobId,
    pub tube: String,
    pub reserve_count: u32,
    pub decision: RetryDecision,
}

/// Table-driven retry policy: attempt count in, delay or bury out.
///
/// One plot is shared by every tube unless a tube carries its own.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    plot: RetryPlot,
    tube_plots: HashMap<String, RetryPlot>,
    priority: JobPriority,
}

impl RetryPolicy {
    pub fn new(plot: RetryPlot) -> Self {
        Self {
            plot,
            tube_plots: HashMap::new(),
            priority: JobPriority::DEFAULT,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let mut policy = Self::new(RetryPlot::new(config.plot.clone())?)
            .with_priority(config.default_priority());
        for (name, tube) in &config.tubes {
            if let Some(plot) = &tube.plot {
                policy = policy.with_tube_plot(name, RetryPlot::new(plot.clone())?);
            }
        }
        Ok(policy)
    }

    pub fn with_tube_plot(mut self, tube: &str, plot: RetryPlot) -> Self {
        self.tube_plots.insert(normalize_tube(tube), plot);
        self
    }

    /// Priority applied when releasing and burying.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn plot_for(&self, tube: &str) -> &RetryPlot {
        self.tube_plots.get(&normalize_tube(tube)).unwrap_or(&self.plot)
    }

    /// Pure decision for a job on `tube` with `reserve_count` previous
    /// reservations.
    pub fn decide(&self, tube: &str, reserve_count: u32) -> RetryDecision {
        match self.plot_for(tube).delay_for(reserve_count) {
            Some(delay_secs) => RetryDecision::Release { delay_secs },
            None => RetryDecision::Bury,
        }
    }

    /// Read the job's reservation count from the broker and release or bury
    /// it accordingly.
    ///
    /// The broker's `reserves` counter includes the reservation currently
    /// held, so the number of previous reservations is one less.
    pub async fn escalate(&self, broker: &dyn Broker, job_id: JobId) -> Result<Escalation> {
        let stats = broker.stats_job(job_id).await?;
        let reserve_count = stats.reserves.saturating_sub(1);
        let decision = self.decide(&stats.tube, reserve_count);

        async {
            match decision {
                RetryDecision::Release { delay_secs } => {
                    broker.release(job_id, self.priority, delay_secs).await?;
                    tracing::info!(delay_secs, "job released for retry");
                }
                RetryDecision::Bury => {
                    broker.bury(job_id, self.priority).await?;
                    tracing::warn!(
                        plot_len = self.plot_for(&stats.tube).len(),
                        "retries exhausted, job buried"
                    );
                }
            }
            Ok::<_, QueueError>(())
        }
        .instrument(job_escalate_span(job_id.to_string(), reserve_count))
        .await?;

        Ok(Escalation {
            job_id,
            tube: normalize_tube(&stats.tube),
            reserve_count,
            decision,
        })
    }
}
