//! Job types for per-shop work queues

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::RetryPolicy;

/// Payload of one delivery job: deliver `event_id` to `registration_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookJob {
    pub event_id: Uuid,
    pub shop_id: Uuid,
    pub registration_id: Uuid,
}

/// Job lifecycle inside a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// A job leased to a consumer
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub data: WebhookJob,
    /// Failed tries so far (circuit deferrals are not counted)
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Token that must accompany complete/fail/delay
    pub token: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// Queue depth breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Outstanding work: waiting + active + delayed
    pub fn depth(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }

    pub fn is_drained(&self) -> bool {
        self.depth() == 0
    }
}

/// Outcome of failing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailureOutcome {
    /// Job delayed for another try
    WillRetry { attempts_made: u32, delay: Duration },

    /// No attempts left; job moved to failed
    Exhausted { attempts_made: u32 },
}

/// Options applied when a queue is opened
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub retry: RetryPolicy,
}

impl QueueOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
