use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;

/// Floor on the pause between empty polls and after broker errors.
pub const MIN_IDLE_WAIT_MS: u64 = 10;

/// Configuration for the dispatch loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier used in log records.
    pub worker_id: String,
    /// Broker-side wait of a single reserve call, in seconds. Bounds how long
    /// shutdown waits for an idle loop. Zero turns reserve into a poll, which
    /// the loop paces with [`idle_wait`](Self::idle_wait).
    pub reserve_timeout_secs: u64,
    /// Sleep after a broker error, or after an empty zero-timeout poll, in
    /// milliseconds.
    pub error_backoff_ms: u64,
    /// How long `shutdown` waits for the in-flight job, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::default().with_reserve_timeout(config.reserve_timeout_secs)
    }

    pub fn with_reserve_timeout(mut self, secs: u64) -> Self {
        self.reserve_timeout_secs = secs;
        self
    }

    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Pause used between loop iterations that did no work; never below
    /// [`MIN_IDLE_WAIT_MS`].
    pub fn idle_wait(&self) -> Duration {
        self.error_backoff().max(Duration::from_millis(MIN_IDLE_WAIT_MS))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "dispatcher-0".to_string(),
            reserve_timeout_secs: 5,
            error_backoff_ms: 500,
            shutdown_timeout_secs: 30,
        }
    }
}
