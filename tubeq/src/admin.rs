//! Operational and read-only queries over a broker connection.
//!
//! Operations that reference a job id are best-effort: a job that no longer
//! exists yields `false` or `None` instead of an error. Transport failures
//! still propagate.

use std::sync::Arc;

use serde::Serialize;

use crate::broker::Broker;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::job::{Envelope, Job, JobId};
use crate::registry::TubeRegistry;
use crate::stats::{JobStats, ServerStats, TubeStats};

/// Description reported for a watched tube with no local registration.
pub const UNUSED_TUBE_DESCRIPTION: &str = "unused";

/// Broker statistics for one tube plus its configured description.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TubeInfo {
    pub desc: String,
    #[serde(flatten)]
    pub stats: TubeStats,
}

/// Broker statistics for one job plus its decoded envelope.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub stats: JobStats,
    /// `None` when the body is not a valid envelope.
    pub data: Option<Envelope>,
}

/// Broker endpoint merged with the server's statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub stats: ServerStats,
}

#[derive(Clone)]
pub struct AdminFacade {
    broker: Arc<dyn Broker>,
    registry: Arc<TubeRegistry>,
    host: String,
    port: u16,
}

impl std::fmt::Debug for AdminFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminFacade")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tubes", &self.registry.len())
            .finish()
    }
}

impl AdminFacade {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<TubeRegistry>) -> Self {
        Self {
            broker,
            registry,
            host: String::new(),
            port: 0,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, registry: Arc<TubeRegistry>, config: &ServiceConfig) -> Self {
        Self::new(broker, registry).with_endpoint(&config.host, config.port)
    }

    /// Endpoint reported by [`service_info`](Self::service_info).
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Whether the broker answers a stats round-trip.
    pub async fn is_alive(&self) -> bool {
        match self.broker.server_stats().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("broker liveness check failed: {err}");
                false
            }
        }
    }

    pub async fn server_stats(&self) -> Result<ServerStats> {
        self.broker.server_stats().await
    }

    pub async fn service_info(&self) -> Result<ServiceInfo> {
        Ok(ServiceInfo {
            host: self.host.clone(),
            port: self.port,
            stats: self.broker.server_stats().await?,
        })
    }

    pub async fn list_tubes(&self) -> Result<Vec<String>> {
        self.broker.list_tubes().await
    }

    pub async fn list_watched_tubes(&self) -> Result<Vec<String>> {
        self.broker.list_watched_tubes().await
    }

    /// Statistics for every tube this connection watches, each labelled
    /// with its configured description.
    pub async fn stats_tubes(&self) -> Result<Vec<TubeInfo>> {
        let mut tubes = Vec::new();
        for tube in self.broker.list_watched_tubes().await? {
            tubes.push(self.stats_tube_by_name(&tube).await?);
        }
        Ok(tubes)
    }

    pub async fn stats_tube_by_name(&self, tube: &str) -> Result<TubeInfo> {
        let tube = self.broker_tube(tube);
        let stats = self.broker.stats_tube(&tube).await?;
        let desc = self
            .registry
            .description(&tube)
            .unwrap_or(UNUSED_TUBE_DESCRIPTION)
            .to_string();
        Ok(TubeInfo { desc, stats })
    }

    pub async fn pause_tube(&self, tube: &str, secs: u32) -> Result<()> {
        let tube = self.broker_tube(tube);
        self.broker.pause_tube(&tube, secs).await?;
        tracing::info!(%tube, secs, "tube paused");
        Ok(())
    }

    pub async fn resume_tube(&self, tube: &str) -> Result<()> {
        let tube = self.broker_tube(tube);
        self.broker.pause_tube(&tube, 0).await?;
        tracing::info!(%tube, "tube resumed");
        Ok(())
    }

    pub async fn peek(&self, id: JobId) -> Result<Option<JobInfo>> {
        let job = self.broker.peek(id).await;
        self.describe(job).await
    }

    pub async fn peek_next_ready(&self, tube: &str) -> Result<Option<JobInfo>> {
        let job = self.broker.peek_ready(&self.broker_tube(tube)).await;
        self.describe(job).await
    }

    pub async fn peek_next_delayed(&self, tube: &str) -> Result<Option<JobInfo>> {
        let job = self.broker.peek_delayed(&self.broker_tube(tube)).await;
        self.describe(job).await
    }

    pub async fn peek_next_buried(&self, tube: &str) -> Result<Option<JobInfo>> {
        let job = self.broker.peek_buried(&self.broker_tube(tube)).await;
        self.describe(job).await
    }

    /// Name the broker knows `tube` by: the registered (upper-cased) name
    /// when it resolves locally, otherwise `tube` unchanged.
    fn broker_tube(&self, tube: &str) -> String {
        match self.registry.get(tube) {
            Some(definition) => definition.name.clone(),
            None => tube.to_string(),
        }
    }

    async fn describe(&self, job: Result<Job>) -> Result<Option<JobInfo>> {
        let Some(job) = found(job)? else {
            return Ok(None);
        };
        let Some(stats) = found(self.broker.stats_job(job.id).await)? else {
            return Ok(None);
        };
        Ok(Some(JobInfo {
            stats,
            data: job.envelope().ok(),
        }))
    }

    /// Move a buried or delayed job back to ready.
    pub async fn kick(&self, id: JobId) -> Result<bool> {
        if found(self.broker.peek(id).await)?.is_none() {
            return Ok(false);
        }
        let kicked = found(self.broker.kick(id).await)?.is_some();
        if kicked {
            tracing::info!(job_id = %id, "job kicked");
        }
        Ok(kicked)
    }

    /// Manual retry: same as [`kick`](Self::kick).
    pub async fn exec(&self, id: JobId) -> Result<bool> {
        self.kick(id).await
    }

    /// Manual release of a stuck job back to ready; performed as a kick
    /// because only the reserving connection may issue a broker `release`.
    pub async fn release(&self, id: JobId) -> Result<bool> {
        self.kick(id).await
    }

    pub async fn delete(&self, id: JobId) -> Result<bool> {
        if found(self.broker.peek(id).await)?.is_none() {
            return Ok(false);
        }
        let deleted = found(self.broker.delete(id).await)?.is_some();
        if deleted {
            tracing::info!(job_id = %id, "job deleted");
        }
        Ok(deleted)
    }
}

/// Map a not-found failure to `None`; any other failure propagates.
fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => {
            tracing::debug!("best-effort admin call: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
