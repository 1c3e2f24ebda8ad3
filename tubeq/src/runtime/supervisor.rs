use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::error::{QueueError, Result};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::handler::{HandlerOutcome, TubeHandler};
use crate::job::{Envelope, Job, JobId, JobPriority};
use crate::registry::TubeRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry::{
    instrument_dispatch, record_broker_error, record_dispatch_outcome, record_handler_end,
    record_handler_start, AuditLog,
};

use super::worker::WorkerConfig;

/// Tube the broker puts every connection on until told otherwise.
pub const DEFAULT_TUBE: &str = "default";

/// Token for signaling graceful shutdown to the dispatch loop.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome of processing one reserved job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Handler succeeded; job deleted.
    Completed,
    /// Poison message deleted without retry.
    Discarded { reason: String },
    /// Handler failed; job released with a backoff delay.
    Released { delay_secs: u32, reserve_count: u32 },
    /// Handler failed with retries exhausted; job buried.
    Buried { reserve_count: u32 },
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Discarded { .. } => "discarded",
            Self::Released { .. } => "released",
            Self::Buried { .. } => "buried",
        }
    }
}

/// What happened to one reserved job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub job_id: JobId,
    /// Upper-cased tube the envelope routed to; `None` when it never
    /// resolved.
    pub tube: Option<String>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

/// Where poison messages are copied before deletion.
#[derive(Clone, Debug)]
pub(crate) struct PoisonRoute {
    pub tube: String,
    pub priority: JobPriority,
    pub ttr_secs: u32,
}

/// Reservation loop: reserves one job at a time, routes it by tag to its
/// tube handler and drives it to deletion, release or burial.
///
/// Dispatch-time failures never escape [`run`](Self::run): a bad job is
/// discarded or escalated, and broker errors are logged and followed by a
/// backoff sleep.
pub struct ConsumerDispatcher {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: Arc<TubeRegistry>,
    pub(crate) retry: RetryPolicy,
    pub(crate) watch: BTreeSet<String>,
    pub(crate) ignore_default_tube: bool,
    pub(crate) poison: Option<PoisonRoute>,
    pub(crate) worker: WorkerConfig,
    pub(crate) audit: AuditLog,
    pub(crate) events: Option<Arc<dyn JobEventPublisher>>,
    pub(crate) shutdown_token: ShutdownToken,
    pub(crate) loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConsumerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDispatcher")
            .field("watch", &self.watch)
            .field("ignore_default_tube", &self.ignore_default_tube)
            .field("poison", &self.poison)
            .field("worker", &self.worker)
            .field("retry", &self.retry)
            .field("events_set", &self.events.is_some())
            .field("cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

enum Classified<'a> {
    Poison { tube: Option<String>, reason: String },
    Routed { tube: String, handler: &'a Arc<dyn TubeHandler>, envelope: Envelope },
}

impl ConsumerDispatcher {
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Normalized names of the tubes this dispatcher watches.
    pub fn watched(&self) -> &BTreeSet<String> {
        &self.watch
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Subscribe the connection to the configured tubes and drop `default`.
    ///
    /// Returns the number of tubes watched afterwards.
    pub async fn prepare(&self) -> Result<usize> {
        let mut watching = 0;
        for tube in &self.watch {
            watching = self
                .broker
                .watch(tube)
                .await
                .inspect_err(|err| record_broker_error("watch", err))?;
        }
        if self.ignore_default_tube && !self.watch.iter().any(|t| t.eq_ignore_ascii_case(DEFAULT_TUBE)) {
            watching = self
                .broker
                .ignore(DEFAULT_TUBE)
                .await
                .inspect_err(|err| record_broker_error("ignore", err))?;
        }
        tracing::info!(
            worker_id = %self.worker.worker_id,
            tubes = ?self.watch,
            watching,
            "dispatcher subscribed"
        );
        Ok(watching)
    }

    /// Run one reservation cycle.
    ///
    /// `Ok(None)` means the reserve timed out with nothing to do.
    pub async fn reserve_next(&self) -> Result<Option<DispatchReport>> {
        let reserved = self
            .broker
            .reserve(self.worker.reserve_timeout())
            .await
            .inspect_err(|err| record_broker_error("reserve", err))?;
        let Some(job) = reserved else {
            return Ok(None);
        };
        self.publish(job.id, None, JobEventPayload::Reserved).await;
        self.process(job).await.map(Some)
    }

    /// Classify and settle one reserved job.
    ///
    /// Errors are broker failures while settling; the job then stays
    /// reserved until its ttr expires and the broker hands it out again.
    pub async fn process(&self, job: Job) -> Result<DispatchReport> {
        let id = job.id;
        let report = match self.classify(&job) {
            Classified::Poison { tube, reason } => {
                let label = tube.clone().unwrap_or_else(|| "-".to_string());
                instrument_dispatch(id.to_string(), label, self.discard(&job, tube, reason)).await?
            }
            Classified::Routed { tube, handler, envelope } => {
                let label = tube.clone();
                instrument_dispatch(id.to_string(), label, self.invoke(&job, tube, handler, envelope))
                    .await?
            }
        };

        let tube_label = report.tube.as_deref().unwrap_or("-");
        record_dispatch_outcome(id, tube_label, report.outcome.as_str());
        self.publish(id, report.tube.clone(), outcome_event(&report.outcome)).await;
        Ok(report)
    }

    fn classify<'a>(&'a self, job: &Job) -> Classified<'a> {
        let envelope = match job.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                return Classified::Poison {
                    tube: None,
                    reason: format!("undecodable body: {err}"),
                }
            }
        };
        let Some(tag) = envelope.tag.as_deref() else {
            return Classified::Poison {
                tube: None,
                reason: "tube not found: envelope has no tag".to_string(),
            };
        };
        let definition = match self.registry.resolve(tag) {
            Ok(definition) => definition,
            Err(err) => {
                return Classified::Poison {
                    tube: None,
                    reason: format!("tube not found: {err}"),
                }
            }
        };
        match definition.handler() {
            Some(handler) => Classified::Routed {
                tube: definition.name.clone(),
                handler,
                envelope,
            },
            None => Classified::Poison {
                tube: Some(definition.name.clone()),
                reason: QueueError::HandlerMissing(definition.name.clone()).to_string(),
            },
        }
    }

    async fn discard(&self, job: &Job, tube: Option<String>, reason: String) -> Result<DispatchReport> {
        let error = match &tube {
            Some(tube) => QueueError::HandlerMissing(tube.clone()),
            None => QueueError::UnroutableTag {
                id: job.id,
                reason: reason.clone(),
            },
        };
        tracing::error!(job_id = %job.id, "discarding poison message: {error}");

        if let Some(poison) = &self.poison {
            let copy = self
                .broker
                .put(&poison.tube, &job.body, poison.priority, 0, poison.ttr_secs)
                .await
                .inspect_err(|err| record_broker_error("put", err))?;
            tracing::warn!(job_id = %job.id, copy_id = %copy, poison_tube = %poison.tube, "poison message preserved");
        }

        self.broker
            .delete(job.id)
            .await
            .inspect_err(|err| record_broker_error("delete", err))?;
        let raw = String::from_utf8_lossy(&job.body);
        self.audit.record(Some(job.id), &reason, Some(&*raw));

        Ok(DispatchReport {
            job_id: job.id,
            tube,
            outcome: DispatchOutcome::Discarded { reason },
        })
    }

    async fn invoke(
        &self,
        job: &Job,
        tube: String,
        handler: &Arc<dyn TubeHandler>,
        envelope: Envelope,
    ) -> Result<DispatchReport> {
        let timing = record_handler_start(job.id);
        let result = match envelope.payload() {
            Some(payload) => {
                match AssertUnwindSafe(handler.process(payload)).catch_unwind().await {
                    Ok(Ok(outcome)) if outcome.is_success() => Ok(outcome),
                    Ok(Ok(outcome)) => Err(format!("handler returned {outcome}")),
                    Ok(Err(err)) => Err(format!("handler error: {err:#}")),
                    Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
                }
            }
            None => Err(format!("job data is not an object: {}", envelope.data)),
        };

        match result {
            Ok(outcome) => {
                record_handler_end(timing, &tube, "completed");
                self.complete(job, tube, &envelope, outcome).await
            }
            Err(reason) => {
                record_handler_end(timing, &tube, "failed");
                self.fail(job, tube, &envelope, reason).await
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        tube: String,
        envelope: &Envelope,
        outcome: HandlerOutcome,
    ) -> Result<DispatchReport> {
        self.broker
            .delete(job.id)
            .await
            .inspect_err(|err| record_broker_error("delete", err))?;
        tracing::info!(job_id = %job.id, tube = %tube, "job completed ({outcome})");
        self.audit.record(Some(job.id), "job completed", Some(envelope));
        Ok(DispatchReport {
            job_id: job.id,
            tube: Some(tube),
            outcome: DispatchOutcome::Completed,
        })
    }

    async fn fail(&self, job: &Job, tube: String, envelope: &Envelope, reason: String) -> Result<DispatchReport> {
        let error = QueueError::HandlerFailure {
            tube: tube.clone(),
            reason,
        };
        tracing::error!(job_id = %job.id, "{error}");

        let escalation = self
            .retry
            .escalate(self.broker.as_ref(), job.id)
            .await
            .inspect_err(|err| record_broker_error("escalate", err))?;
        self.audit
            .record(Some(job.id), &error.to_string(), Some(envelope));

        let outcome = match escalation.decision {
            RetryDecision::Release { delay_secs } => DispatchOutcome::Released {
                delay_secs,
                reserve_count: escalation.reserve_count,
            },
            RetryDecision::Bury => DispatchOutcome::Buried {
                reserve_count: escalation.reserve_count,
            },
        };
        Ok(DispatchReport {
            job_id: job.id,
            tube: Some(tube),
            outcome,
        })
    }

    async fn publish(&self, job_id: JobId, tube: Option<String>, payload: JobEventPayload) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.publish(JobEvent::new(job_id, tube, payload)).await {
            tracing::warn!(job_id = %job_id, "failed to publish job event: {err}");
        }
    }

    /// Drive the reservation loop until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between reservations; the in-flight job is
    /// always settled first.
    pub async fn run(&self, shutdown: ShutdownToken) {
        tracing::info!(worker_id = %self.worker.worker_id, "dispatcher loop started");
        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker_id = %self.worker.worker_id, "dispatcher shutting down");
                break;
            }

            match self.reserve_next().await {
                Ok(Some(report)) => {
                    tracing::debug!(job_id = %report.job_id, outcome = report.outcome.as_str(), "job settled");
                }
                Ok(None) if self.worker.reserve_timeout().is_zero() => {
                    // Zero-timeout reserve returns at once; pace the polls.
                    idle(&shutdown, self.worker.idle_wait()).await;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(worker_id = %self.worker.worker_id, "dispatch error: {err}");
                    idle(&shutdown, self.worker.idle_wait()).await;
                }
            }
        }
    }

    /// Subscribe to the configured tubes and spawn the loop on the tokio
    /// runtime.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return Err(QueueError::Config("dispatcher already started".into()));
        }
        self.prepare().await?;

        let this = Arc::clone(self);
        let token = self.shutdown_token.clone();
        *guard = Some(tokio::spawn(async move { this.run(token).await }));
        Ok(())
    }

    /// Stop reserving and wait for the in-flight job to settle.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(worker_id = %self.worker.worker_id, "initiating dispatcher shutdown");
        self.shutdown_token.cancel();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.worker.shutdown_timeout(), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("dispatcher task failed: {e:?}"),
                Err(_) => tracing::warn!("dispatcher task timed out during shutdown"),
            }
        }

        tracing::info!(worker_id = %self.worker.worker_id, "dispatcher shutdown complete");
        Ok(())
    }
}

/// Sleep for `wait`, returning early on cancellation.
async fn idle(shutdown: &ShutdownToken, wait: std::time::Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}

fn outcome_event(outcome: &DispatchOutcome) -> JobEventPayload {
    match outcome {
        DispatchOutcome::Completed => JobEventPayload::Completed,
        DispatchOutcome::Discarded { reason } => JobEventPayload::Discarded {
            reason: reason.clone(),
        },
        DispatchOutcome::Released {
            delay_secs,
            reserve_count,
        } => JobEventPayload::Released {
            delay_secs: *delay_secs,
            reserve_count: *reserve_count,
        },
        DispatchOutcome::Buried { reserve_count } => JobEventPayload::Buried {
            reserve_count: *reserve_count,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        assert!(!ShutdownToken::default().is_cancelled());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_report_serializes_flat() {
        let report = DispatchReport {
            job_id: JobId(4),
            tube: Some("MAIL".into()),
            outcome: DispatchOutcome::Released {
                delay_secs: 10,
                reserve_count: 0,
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "released");
        assert_eq!(json["delay_secs"], 10);
        assert_eq!(json["tube"], "MAIL");
    }
}
