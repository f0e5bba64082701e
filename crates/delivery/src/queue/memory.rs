//! In-memory implementation of JobQueue and QueueBackend

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::job::{
    ClaimedJob, JobCounts, JobFailureOutcome, JobState, QueueOptions, WebhookJob,
};
use super::store::{JobQueue, QueueBackend, QueueError};
use crate::reliability::RetryPolicy;

/// Finished jobs kept for inspection; older ones only survive in the tallies
pub const RETAINED_FINISHED_JOBS: usize = 1_000;

struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

struct JobRecord {
    data: WebhookJob,
    state: JobState,
    attempts_made: u32,
    run_at: Option<DateTime<Utc>>,
    lease: Option<Lease>,
    failed_reason: Option<String>,
}

impl JobRecord {
    /// Effective state at `now`: due delays and lapsed leases count as waiting
    fn effective_state(&self, now: DateTime<Utc>) -> JobState {
        match self.state {
            JobState::Delayed if self.run_at.is_some_and(|at| at <= now) => JobState::Waiting,
            JobState::Active if self.lease.as_ref().is_some_and(|l| l.expires_at <= now) => {
                JobState::Waiting
            }
            state => state,
        }
    }

    fn holds_lease(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.token == token && l.expires_at > now)
    }
}

#[derive(Default)]
struct QueueInner {
    /// Waiting, active and delayed jobs
    jobs: HashMap<Uuid, JobRecord>,
    /// Unfinished jobs in insertion order
    order: VecDeque<Uuid>,
    /// Most recently finished jobs, oldest first
    finished: VecDeque<(Uuid, JobRecord)>,
    completed: u64,
    failed: u64,
}

impl QueueInner {
    fn leased_mut(
        &mut self,
        job_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<&mut JobRecord, QueueError> {
        let record = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        if !record.holds_lease(token, now) {
            return Err(QueueError::LeaseMismatch {
                job_id,
                token: token.to_string(),
            });
        }
        Ok(record)
    }

    /// Move a job out of the live set once it is completed or failed
    fn finish(&mut self, job_id: Uuid) {
        self.order.retain(|id| *id != job_id);
        let Some(record) = self.jobs.remove(&job_id) else {
            return;
        };
        match record.state {
            JobState::Failed => self.failed += 1,
            _ => self.completed += 1,
        }
        if self.finished.len() == RETAINED_FINISHED_JOBS {
            self.finished.pop_front();
        }
        self.finished.push_back((job_id, record));
    }

    fn record(&self, job_id: Uuid) -> Option<&JobRecord> {
        self.jobs.get(&job_id).or_else(|| {
            self.finished
                .iter()
                .rev()
                .find(|(id, _)| *id == job_id)
                .map(|(_, record)| record)
        })
    }
}

/// In-memory job queue
///
/// Provides the same lease semantics as a shared job store within one
/// process. Jobs are claimed in insertion order; delayed jobs become
/// claimable once their run time passes, and jobs whose lease lapses are
/// claimable again immediately.
pub struct InMemoryJobQueue {
    name: String,
    retry: RetryPolicy,
    inner: Mutex<QueueInner>,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>, options: &QueueOptions) -> Self {
        Self {
            name: name.into(),
            retry: options.retry.clone(),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Effective state of a job (for testing and inspection)
    pub fn job_state(&self, job_id: Uuid) -> Option<JobState> {
        let now = Utc::now();
        self.inner
            .lock()
            .record(job_id)
            .map(|r| r.effective_state(now))
    }

    /// Failed tries recorded for a job
    pub fn attempts_made(&self, job_id: Uuid) -> Option<u32> {
        self.inner.lock().record(job_id).map(|r| r.attempts_made)
    }

    /// Reason given by the last failure of a job
    pub fn failed_reason(&self, job_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .record(job_id)
            .and_then(|r| r.failed_reason.clone())
    }

    /// Scheduled run time of a delayed job
    pub fn run_at(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.lock().record(job_id).and_then(|r| r.run_at)
    }

    /// All job payloads currently waiting, active or delayed, oldest first
    pub fn pending_jobs(&self) -> Vec<WebhookJob> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|r| r.data)
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: WebhookJob) -> Result<Uuid, QueueError> {
        let id = Uuid::now_v7();
        let mut inner = self.inner.lock();
        inner.jobs.insert(
            id,
            JobRecord {
                data: job,
                state: JobState::Waiting,
                attempts_made: 0,
                run_at: None,
                lease: None,
                failed_reason: None,
            },
        );
        inner.order.push_back(id);
        Ok(id)
    }

    async fn claim_next(
        &self,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let lock = chrono::Duration::from_std(lock_duration)
            .map_err(|e| QueueError::Backend(format!("invalid lock duration: {e}")))?;
        let expires_at = now + lock;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let next = inner.order.iter().copied().find(|id| {
            inner
                .jobs
                .get(id)
                .is_some_and(|r| r.effective_state(now) == JobState::Waiting)
        });
        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        if let Some(previous) = record.lease.as_ref() {
            debug!(
                queue = %self.name,
                job_id = %job_id,
                previous_token = %previous.token,
                "reclaiming job with lapsed lease"
            );
        }

        record.state = JobState::Active;
        record.run_at = None;
        record.lease = Some(Lease {
            token: token.to_string(),
            expires_at,
        });

        Ok(Some(ClaimedJob {
            id: job_id,
            data: record.data,
            attempts_made: record.attempts_made,
            max_attempts: self.retry.max_attempts,
            token: token.to_string(),
            lease_expires_at: expires_at,
        }))
    }

    async fn complete(&self, job_id: Uuid, token: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner.leased_mut(job_id, token, now)?;
        record.state = JobState::Completed;
        record.lease = None;
        inner.finish(job_id);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        token: &str,
        reason: &str,
    ) -> Result<JobFailureOutcome, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner.leased_mut(job_id, token, now)?;

        record.attempts_made += 1;
        record.lease = None;
        record.failed_reason = Some(reason.to_string());
        let attempts_made = record.attempts_made;

        if self.retry.has_attempts_remaining(attempts_made) {
            let delay = self.retry.delay_after_failures(attempts_made);
            let delay_chrono = chrono::Duration::from_std(delay)
                .map_err(|e| QueueError::Backend(format!("invalid retry delay: {e}")))?;
            record.state = JobState::Delayed;
            record.run_at = Some(now + delay_chrono);
            Ok(JobFailureOutcome::WillRetry {
                attempts_made,
                delay,
            })
        } else {
            record.state = JobState::Failed;
            record.run_at = None;
            inner.finish(job_id);
            Ok(JobFailureOutcome::Exhausted { attempts_made })
        }
    }

    async fn delay_until(
        &self,
        job_id: Uuid,
        token: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner.leased_mut(job_id, token, now)?;
        record.state = JobState::Delayed;
        record.run_at = Some(run_at);
        record.lease = None;
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut counts = JobCounts {
            completed: inner.completed,
            failed: inner.failed,
            ..JobCounts::default()
        };
        for record in inner.jobs.values() {
            match record.effective_state(now) {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

/// In-memory queue backend
///
/// Queues opened under the same name share jobs, so several multiplexers in
/// one process behave like independent processes attached to one job store.
///
/// # Example
///
/// ```
/// use courier_delivery::queue::{InMemoryQueueBackend, QueueBackend, QueueOptions};
///
/// let backend = InMemoryQueueBackend::new();
/// let queue = backend.open("shop-queue-1", &QueueOptions::default());
/// assert_eq!(queue.name(), "shop-queue-1");
/// ```
#[derive(Default)]
pub struct InMemoryQueueBackend {
    queues: DashMap<String, Arc<InMemoryJobQueue>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle to a queue that has been opened (for testing)
    pub fn queue(&self, name: &str) -> Option<Arc<InMemoryJobQueue>> {
        self.queues.get(name).map(|q| q.value().clone())
    }

    /// Number of queues opened so far
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl QueueBackend for InMemoryQueueBackend {
    fn open(&self, name: &str, options: &QueueOptions) -> Arc<dyn JobQueue> {
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryJobQueue::new(name, options)))
            .value()
            .clone();
        queue
    }
}
