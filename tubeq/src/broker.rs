use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{Job, JobId, JobPriority};
use crate::stats::{JobStats, ServerStats, TubeStats};

/// Call-level contract of a delay-queue broker connection.
///
/// Every operation is a round-trip to the broker. Failures surface as
/// [`QueueError::BrokerUnavailable`](crate::QueueError::BrokerUnavailable) or a
/// not-found condition; implementors never retry, retry policy lives above
/// this layer.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue `body` on `tube`. Returns the broker-assigned id.
    async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: JobPriority,
        delay_secs: u32,
        ttr_secs: u32,
    ) -> Result<JobId>;

    /// Wait up to `timeout` for a ready job on any watched tube.
    ///
    /// `Ok(None)` means the wait timed out.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>>;

    async fn delete(&self, id: JobId) -> Result<()>;

    /// Return a reserved job to the ready queue, or to the delayed queue
    /// when `delay_secs > 0`.
    async fn release(&self, id: JobId, priority: JobPriority, delay_secs: u32) -> Result<()>;

    /// Move a reserved job to the buried (dead-letter) state.
    async fn bury(&self, id: JobId, priority: JobPriority) -> Result<()>;

    /// Move a buried or delayed job to the ready state.
    async fn kick(&self, id: JobId) -> Result<()>;

    async fn peek(&self, id: JobId) -> Result<Job>;

    async fn peek_ready(&self, tube: &str) -> Result<Job>;

    async fn peek_delayed(&self, tube: &str) -> Result<Job>;

    async fn peek_buried(&self, tube: &str) -> Result<Job>;

    async fn stats_job(&self, id: JobId) -> Result<JobStats>;

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats>;

    async fn server_stats(&self) -> Result<ServerStats>;

    /// Add `tube` to the watch list. Returns the number of watched tubes.
    async fn watch(&self, tube: &str) -> Result<usize>;

    /// Remove `tube` from the watch list. Returns the number of watched tubes.
    async fn ignore(&self, tube: &str) -> Result<usize>;

    /// Stop handing out jobs from `tube` for `secs` seconds; 0 resumes it.
    async fn pause_tube(&self, tube: &str, secs: u32) -> Result<()>;

    async fn list_tubes(&self) -> Result<Vec<String>>;

    async fn list_watched_tubes(&self) -> Result<Vec<String>>;
}
