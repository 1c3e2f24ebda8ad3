use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tubeq::*;

/// Broker call recorded by [`InMemoryBroker`] after it succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put {
        tube: String,
        id: JobId,
        priority: JobPriority,
        delay_secs: u32,
        ttr_secs: u32,
    },
    Reserve { id: JobId },
    Delete { id: JobId },
    Release { id: JobId, delay_secs: u32 },
    Bury { id: JobId },
    Kick { id: JobId },
    PauseTube { tube: String, secs: u32 },
    Watch { tube: String },
    Ignore { tube: String },
}

/// In-process broker with beanstalkd semantics for a single connection.
///
/// Time only moves through [`advance`](Self::advance): delays, ttr expiry and
/// tube pauses are all measured on that manual clock. A reserve with nothing
/// ready sleeps briefly and returns `None`.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    idle_wait: Duration,
}

struct State {
    now: u64,
    next_id: u64,
    jobs: BTreeMap<JobId, StoredJob>,
    tubes: BTreeMap<String, TubeState>,
    watched: Vec<String>,
    ops: Vec<Op>,
    calls: usize,
    failures: u32,
}

#[derive(Clone, Debug)]
struct StoredJob {
    id: JobId,
    tube: String,
    body: Vec<u8>,
    priority: JobPriority,
    state: JobState,
    created_at: u64,
    delay: u64,
    ready_at: u64,
    ttr: u64,
    deadline: u64,
    reserves: u32,
    timeouts: u32,
    releases: u32,
    buries: u32,
    kicks: u32,
}

#[derive(Clone, Debug, Default)]
struct TubeState {
    total_jobs: u64,
    cmd_delete: u64,
    cmd_pause: u64,
    pause: u64,
    paused_until: u64,
}

impl State {
    fn tick(&mut self) {
        let now = self.now;
        for job in self.jobs.values_mut() {
            match job.state {
                JobState::Delayed if job.ready_at <= now => {
                    job.state = JobState::Ready;
                }
                JobState::Reserved if job.deadline <= now => {
                    job.state = JobState::Ready;
                    job.timeouts += 1;
                }
                _ => {}
            }
        }
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut StoredJob> {
        self.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))
    }

    fn tube_entry(&mut self, tube: &str) -> &mut TubeState {
        self.tubes.entry(tube.to_string()).or_default()
    }

    fn is_paused(&self, tube: &str) -> bool {
        self.tubes
            .get(tube)
            .is_some_and(|t| t.paused_until > self.now)
    }

    fn count(&self, tube: &str, state: JobState) -> u64 {
        self.jobs
            .values()
            .filter(|j| j.tube == tube && j.state == state)
            .count() as u64
    }

    fn stats_for(&self, job: &StoredJob) -> JobStats {
        let time_left = match job.state {
            JobState::Reserved => job.deadline.saturating_sub(self.now),
            JobState::Delayed => job.ready_at.saturating_sub(self.now),
            _ => 0,
        };
        JobStats {
            id: job.id,
            tube: job.tube.clone(),
            state: job.state,
            pri: job.priority,
            age: self.now - job.created_at,
            delay: job.delay,
            ttr: job.ttr,
            time_left,
            file: 0,
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        }
    }

    fn first_in(&self, tube: &str, state: JobState) -> Option<&StoredJob> {
        let candidates = self
            .jobs
            .values()
            .filter(|j| j.tube == tube && j.state == state);
        match state {
            JobState::Ready => candidates.min_by_key(|j| (j.priority, j.id)),
            JobState::Delayed => candidates.min_by_key(|j| (j.ready_at, j.id)),
            _ => candidates.min_by_key(|j| j.id),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let mut tubes = BTreeMap::new();
        tubes.insert(DEFAULT_TUBE.to_string(), TubeState::default());
        Self {
            state: Arc::new(Mutex::new(State {
                now: 0,
                next_id: 1,
                jobs: BTreeMap::new(),
                tubes,
                watched: vec![DEFAULT_TUBE.to_string()],
                ops: Vec::new(),
                calls: 0,
                failures: 0,
            })),
            idle_wait: Duration::from_millis(5),
        }
    }

    /// How long an empty reserve waits before returning `None`. Capped by
    /// the reserve timeout.
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// Move the manual clock forward.
    pub fn advance(&self, secs: u64) {
        let mut state = self.state.lock();
        state.now += secs;
        state.tick();
    }

    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    /// Fail the next `count` calls with `BrokerUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures = count;
    }

    /// Successful mutating calls, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Every trait call made so far, successful or not.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        let mut state = self.state.lock();
        state.tick();
        state.jobs.get(&id).map(|j| j.state)
    }

    pub fn job_body(&self, id: JobId) -> Option<Vec<u8>> {
        self.state.lock().jobs.get(&id).map(|j| j.body.clone())
    }

    /// Number of jobs on `tube` in `job_state`.
    pub fn count(&self, tube: &str, job_state: JobState) -> u64 {
        let mut state = self.state.lock();
        state.tick();
        state.count(tube, job_state)
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn assert_ops_eq(&self, expected: &[Op]) {
        let ops = self.ops();
        assert_eq!(ops, expected, "Expected ops {expected:?}, got {ops:?}");
    }

    fn enter(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        state.calls += 1;
        if state.failures > 0 {
            state.failures -= 1;
            tracing::debug!(remaining = state.failures, "injecting broker failure");
            return Err(QueueError::BrokerUnavailable("injected failure".into()));
        }
        state.tick();
        Ok(state)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("now", &state.now)
            .field("jobs", &state.jobs.len())
            .field("watched", &state.watched)
            .finish()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: JobPriority,
        delay_secs: u32,
        ttr_secs: u32,
    ) -> Result<JobId> {
        let mut state = self.enter()?;
        let id = JobId(state.next_id);
        state.next_id += 1;
        let now = state.now;
        let delay = u64::from(delay_secs);
        state.jobs.insert(
            id,
            StoredJob {
                id,
                tube: tube.to_string(),
                body: body.to_vec(),
                priority,
                state: if delay > 0 { JobState::Delayed } else { JobState::Ready },
                created_at: now,
                delay,
                ready_at: now + delay,
                ttr: u64::from(ttr_secs.max(1)),
                deadline: 0,
                reserves: 0,
                timeouts: 0,
                releases: 0,
                buries: 0,
                kicks: 0,
            },
        );
        state.tube_entry(tube).total_jobs += 1;
        state.ops.push(Op::Put {
            tube: tube.to_string(),
            id,
            priority,
            delay_secs,
            ttr_secs,
        });
        Ok(id)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        {
            let mut state = self.enter()?;
            let watched: BTreeSet<String> = state
                .watched
                .iter()
                .filter(|t| !state.is_paused(t))
                .cloned()
                .collect();
            let next = state
                .jobs
                .values()
                .filter(|j| j.state == JobState::Ready && watched.contains(&j.tube))
                .min_by_key(|j| (j.priority, j.id))
                .map(|j| j.id);

            if let Some(id) = next {
                let now = state.now;
                let job = state.job_mut(id)?;
                job.state = JobState::Reserved;
                job.reserves += 1;
                job.deadline = now + job.ttr;
                let reserved = Job::new(id, job.body.clone());
                state.ops.push(Op::Reserve { id });
                return Ok(Some(reserved));
            }
        }

        tokio::time::sleep(self.idle_wait.min(timeout)).await;
        Ok(None)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        let mut state = self.enter()?;
        let job = state.jobs.remove(&id).ok_or(QueueError::JobNotFound(id))?;
        state.tube_entry(&job.tube).cmd_delete += 1;
        state.ops.push(Op::Delete { id });
        Ok(())
    }

    async fn release(&self, id: JobId, priority: JobPriority, delay_secs: u32) -> Result<()> {
        let mut state = self.enter()?;
        let now = state.now;
        let job = state.job_mut(id)?;
        if job.state != JobState::Reserved {
            return Err(QueueError::JobNotFound(id));
        }
        job.priority = priority;
        job.releases += 1;
        job.delay = u64::from(delay_secs);
        job.ready_at = now + job.delay;
        job.state = if delay_secs > 0 { JobState::Delayed } else { JobState::Ready };
        state.ops.push(Op::Release { id, delay_secs });
        Ok(())
    }

    async fn bury(&self, id: JobId, priority: JobPriority) -> Result<()> {
        let mut state = self.enter()?;
        let job = state.job_mut(id)?;
        if job.state != JobState::Reserved {
            return Err(QueueError::JobNotFound(id));
        }
        job.priority = priority;
        job.buries += 1;
        job.state = JobState::Buried;
        state.ops.push(Op::Bury { id });
        Ok(())
    }

    async fn kick(&self, id: JobId) -> Result<()> {
        let mut state = self.enter()?;
        let job = state.job_mut(id)?;
        if !matches!(job.state, JobState::Buried | JobState::Delayed) {
            return Err(QueueError::JobNotFound(id));
        }
        job.kicks += 1;
        job.state = JobState::Ready;
        state.ops.push(Op::Kick { id });
        Ok(())
    }

    async fn peek(&self, id: JobId) -> Result<Job> {
        let state = self.enter()?;
        state
            .jobs
            .get(&id)
            .map(|j| Job::new(j.id, j.body.clone()))
            .ok_or(QueueError::JobNotFound(id))
    }

    async fn peek_ready(&self, tube: &str) -> Result<Job> {
        let state = self.enter()?;
        state
            .first_in(tube, JobState::Ready)
            .map(|j| Job::new(j.id, j.body.clone()))
            .ok_or_else(|| QueueError::TubeNotFound(tube.to_string()))
    }

    async fn peek_delayed(&self, tube: &str) -> Result<Job> {
        let state = self.enter()?;
        state
            .first_in(tube, JobState::Delayed)
            .map(|j| Job::new(j.id, j.body.clone()))
            .ok_or_else(|| QueueError::TubeNotFound(tube.to_string()))
    }

    async fn peek_buried(&self, tube: &str) -> Result<Job> {
        let state = self.enter()?;
        state
            .first_in(tube, JobState::Buried)
            .map(|j| Job::new(j.id, j.body.clone()))
            .ok_or_else(|| QueueError::TubeNotFound(tube.to_string()))
    }

    async fn stats_job(&self, id: JobId) -> Result<JobStats> {
        let state = self.enter()?;
        let job = state.jobs.get(&id).ok_or(QueueError::JobNotFound(id))?;
        Ok(state.stats_for(job))
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats> {
        let state = self.enter()?;
        let entry = state
            .tubes
            .get(tube)
            .ok_or_else(|| QueueError::TubeNotFound(tube.to_string()))?;
        let urgent = state
            .jobs
            .values()
            .filter(|j| j.tube == tube && j.state == JobState::Ready && j.priority.0 < 1024)
            .count() as u64;
        let watching = u64::from(state.watched.iter().any(|t| t == tube));
        Ok(TubeStats {
            name: tube.to_string(),
            current_jobs_urgent: urgent,
            current_jobs_ready: state.count(tube, JobState::Ready),
            current_jobs_reserved: state.count(tube, JobState::Reserved),
            current_jobs_delayed: state.count(tube, JobState::Delayed),
            current_jobs_buried: state.count(tube, JobState::Buried),
            total_jobs: entry.total_jobs,
            current_using: 1,
            current_watching: watching,
            current_waiting: 0,
            cmd_delete: entry.cmd_delete,
            cmd_pause_tube: entry.cmd_pause,
            pause: if entry.paused_until > state.now { entry.pause } else { 0 },
            pause_time_left: entry.paused_until.saturating_sub(state.now),
        })
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        let state = self.enter()?;
        let count = |s: JobState| state.jobs.values().filter(|j| j.state == s).count() as u64;
        Ok(ServerStats {
            current_jobs_urgent: 0,
            current_jobs_ready: count(JobState::Ready),
            current_jobs_reserved: count(JobState::Reserved),
            current_jobs_delayed: count(JobState::Delayed),
            current_jobs_buried: count(JobState::Buried),
            total_jobs: state.next_id - 1,
            current_tubes: state.tubes.len() as u64,
            current_connections: 1,
            uptime: state.now,
            version: Some("in-memory".to_string()),
            extra: BTreeMap::new(),
        })
    }

    async fn watch(&self, tube: &str) -> Result<usize> {
        let mut state = self.enter()?;
        if !state.watched.iter().any(|t| t == tube) {
            state.watched.push(tube.to_string());
        }
        state.tube_entry(tube);
        state.ops.push(Op::Watch {
            tube: tube.to_string(),
        });
        Ok(state.watched.len())
    }

    async fn ignore(&self, tube: &str) -> Result<usize> {
        let mut state = self.enter()?;
        if state.watched.len() == 1 && state.watched[0] == tube {
            return Err(QueueError::BrokerRejected {
                command: format!("ignore {tube}"),
                reply: "NOT_IGNORED".to_string(),
            });
        }
        state.watched.retain(|t| t != tube);
        state.ops.push(Op::Ignore {
            tube: tube.to_string(),
        });
        Ok(state.watched.len())
    }

    async fn pause_tube(&self, tube: &str, secs: u32) -> Result<()> {
        let mut state = self.enter()?;
        let now = state.now;
        let entry = state
            .tubes
            .get_mut(tube)
            .ok_or_else(|| QueueError::TubeNotFound(tube.to_string()))?;
        entry.cmd_pause += 1;
        entry.pause = u64::from(secs);
        entry.paused_until = now + u64::from(secs);
        state.ops.push(Op::PauseTube {
            tube: tube.to_string(),
            secs,
        });
        Ok(())
    }

    async fn list_tubes(&self) -> Result<Vec<String>> {
        let state = self.enter()?;
        Ok(state.tubes.keys().cloned().collect())
    }

    async fn list_watched_tubes(&self) -> Result<Vec<String>> {
        let state = self.enter()?;
        Ok(state.watched.clone())
    }
}
