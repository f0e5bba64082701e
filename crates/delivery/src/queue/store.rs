//! JobQueue and QueueBackend trait definitions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{ClaimedJob, JobCounts, JobFailureOutcome, QueueOptions, WebhookJob};

/// Error type for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Caller does not hold the job's lease (wrong token, or lease expired)
    #[error("lease on job {job_id} is not held by {token}")]
    LeaseMismatch { job_id: Uuid, token: String },

    /// Backend failure
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// A durable FIFO of delivery jobs for one shop
///
/// Claiming leases a job to a token for `lock_duration`. A lease that
/// expires without complete/fail/delay releases the job, and another
/// consumer may claim it. Operations with a token that no longer holds the
/// lease fail with [`QueueError::LeaseMismatch`].
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Queue name
    fn name(&self) -> &str;

    /// Append a job in waiting state
    async fn add(&self, job: WebhookJob) -> Result<Uuid, QueueError>;

    /// Lease the oldest runnable job to `token`
    async fn claim_next(
        &self,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Finish a leased job
    async fn complete(&self, job_id: Uuid, token: &str) -> Result<(), QueueError>;

    /// Record a failed try; retries with backoff until attempts run out
    async fn fail(
        &self,
        job_id: Uuid,
        token: &str,
        reason: &str,
    ) -> Result<JobFailureOutcome, QueueError>;

    /// Release a leased job until `run_at` without counting a failure
    async fn delay_until(
        &self,
        job_id: Uuid,
        token: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Depth breakdown
    async fn counts(&self) -> Result<JobCounts, QueueError>;
}

/// Opens named queues
///
/// Opening the same name twice yields handles over the same jobs.
pub trait QueueBackend: Send + Sync + 'static {
    fn open(&self, name: &str, options: &QueueOptions) -> Arc<dyn JobQueue>;
}
