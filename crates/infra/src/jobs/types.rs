//! Job records, lifecycle states and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Identifier of a queued job (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a claim stays valid without renewal before the job counts as stalled.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Wire form of a job: `{ "type": <tag>, "data": <payload> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: JsonValue,
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free worker slot
    Pending,
    /// Held by a worker slot until `locked_until`
    Running,
    /// Completed successfully (only seen when `remove_on_complete` is off)
    Completed,
    /// Failed, will be retried once `run_at` passes
    Failed { error: String, attempt: u32 },
    /// Exhausted its attempts; retained for manual inspection
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }

    /// Stable label, also used as the persisted status column.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How many times a job runs and how long it waits in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before retrying after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Producer-side options for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    pub retry: RetryPolicy,
    /// Higher runs first. Jobs of equal priority run in `run_at` order.
    pub priority: i32,
    /// Initial delay before the job becomes claimable.
    pub delay: Duration,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            priority: 0,
            delay: Duration::ZERO,
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub envelope: JobEnvelope,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    pub priority: i32,
    /// Executions started so far
    pub attempt: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed
    pub run_at: DateTime<Utc>,
    /// Lease of the worker running it; past this the job is stalled
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// One entry per finished attempt, oldest first
    pub history: Vec<JobAttemptRecord>,
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

pub(crate) const STALLED_ERROR: &str = "stalled: worker lease expired";

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}

impl Job {
    pub fn new(envelope: JobEnvelope, options: &EnqueueOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            envelope,
            status: JobStatus::Pending,
            retry_policy: options.retry.clone(),
            priority: options.priority,
            attempt: 0,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            created_at: now,
            updated_at: now,
            run_at: after(now, options.delay),
            locked_until: None,
            history: Vec::new(),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.envelope.job_type
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.run_at <= now
    }

    /// Start an attempt held under a lease of `lease` from `now`.
    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
        self.locked_until = Some(after(now, lease));
    }

    /// Running, but its worker stopped renewing the lease.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Running)
            && self.locked_until.is_none_or(|until| until <= now)
    }

    /// Count a stalled attempt as failed so the retry policy decides what happens next.
    pub fn recover_stalled(&mut self, now: DateTime<Utc>) {
        let started_at = self.updated_at;
        self.mark_failed(STALLED_ERROR.to_string(), started_at, now);
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.locked_until = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
        });
    }

    /// Record a failed attempt: reschedule with backoff, or dead-letter when exhausted.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.updated_at = now;
        self.locked_until = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
        });

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.run_at = after(now, delay);
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.run_at = now;
        self.updated_at = now;
        self.locked_until = None;
        self.history.clear();
    }
}
