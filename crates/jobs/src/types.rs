//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quillforge_core::ProjectId;

/// Status/error strings are truncated to this length before being stored on a
/// job, so oversized provider payloads never leak into status fields.
pub const MAX_ERROR_LEN: usize = 500;

pub(crate) fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        error.to_string()
    } else {
        let mut end = MAX_ERROR_LEN;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        error[..end].to_string()
    }
}

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
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

/// Scheduling priority. Lower values are more urgent; the derived `Ord` gives
/// the total order used by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive work the author is waiting on right now.
    Critical = 0,
    /// Foreground generation (e.g. a chapter the author just requested).
    High = 1,
    /// Default for batch generation.
    Normal = 2,
    /// Background/housekeeping work.
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Job execution status.
///
/// Lifecycle: `Pending → Queued → Running → {Completed | Retrying → Queued |
/// Failed | Cancelled | Expired}`. `Failed` is only reached once the retry
/// budget is exhausted; a job that will be retried moves through `Retrying`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet handed to a queue
    Pending,
    /// Waiting in the queue
    Queued,
    /// Claimed by a worker
    Running,
    /// Completed successfully
    Completed,
    /// Failed with no retries remaining
    Failed { error: String, attempt: u32 },
    /// Failed, waiting for backoff before re-enqueue
    Retrying,
    /// Cancelled before completion
    Cancelled,
    /// Passed its expiry deadline before being claimed
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed { .. }
                | JobStatus::Cancelled
                | JobStatus::Expired
        )
    }
}

/// Errors produced while executing a job on a worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Handler(String),
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("no handler registered for job type '{0}'")]
    MissingHandler(String),
    #[error("handler panicked")]
    Panicked,
}

/// Outcome of one execution attempt. Immutable once attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries: u32,
}

impl JobOutcome {
    pub fn success(data: Option<serde_json::Value>, duration: Duration, retries: u32) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration_ms: duration.as_millis() as u64,
            retries,
        }
    }

    pub fn failure(error: &str, duration: Duration, retries: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(truncate_error(error)),
            duration_ms: duration.as_millis() as u64,
            retries,
        }
    }
}

/// A unit of generation work owned by the queue from enqueue until cleanup.
///
/// Retried jobs are mutated in place and re-inserted, never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Book project this job belongs to
    pub project_id: ProjectId,
    /// Type tag dispatched to a registered handler (e.g. `"chapter.generate"`)
    pub job_type: String,
    /// Opaque JSON payload handed to the handler
    pub payload: serde_json::Value,
    /// Scheduling priority
    pub priority: Priority,
    /// Current status
    pub status: JobStatus,
    /// Retries performed so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Per-attempt execution timeout
    pub timeout: Duration,
    /// Drop the job (as `Expired`) if not claimed by this time
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time; tie-break for equal priority
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Claiming worker, while running
    pub worker_id: Option<u32>,
    /// Outcome of the last attempt, once one finished
    pub result: Option<JobOutcome>,
}

impl Job {
    /// Create a new pending job with default priority and retry budget.
    pub fn new(project_id: ProjectId, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            project_id,
            job_type: job_type.into(),
            payload,
            priority: Priority::default(),
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            expires_at: None,
            created_at: now,
            updated_at: now,
            worker_id: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub(crate) fn mark_queued(&mut self) {
        self.status = JobStatus::Queued;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_running(&mut self, worker_id: Option<u32>) {
        self.status = JobStatus::Running;
        self.worker_id = worker_id;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_completed(&mut self, outcome: JobOutcome) {
        self.status = JobStatus::Completed;
        self.result = Some(outcome);
        self.worker_id = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_retrying(&mut self, outcome: JobOutcome) {
        self.status = JobStatus::Retrying;
        self.result = Some(outcome);
        self.worker_id = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_failed(&mut self, error: &str, outcome: JobOutcome) {
        self.status = JobStatus::Failed {
            error: truncate_error(error),
            attempt: self.retry_count,
        };
        self.result = Some(outcome);
        self.worker_id = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_expired(&mut self) {
        self.status = JobStatus::Expired;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new(ProjectId::new(), "chapter.generate", serde_json::json!({"chapter": 1}))
    }

    #[test]
    fn new_job_is_pending() {
        let job = test_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.priority, Priority::Normal);
        assert!(job.result.is_none());
    }

    #[test]
    fn priority_order_is_urgency_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(JobStatus::Failed { error: "x".into(), attempt: 1 }.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let job = test_job().with_expiry(now - chrono::Duration::seconds(1));
        assert!(job.is_expired(now));

        let job = test_job().with_expiry(now + chrono::Duration::seconds(60));
        assert!(!job.is_expired(now));

        assert!(!test_job().is_expired(now));
    }

    #[test]
    fn failure_outcome_truncates_long_errors() {
        let long = "e".repeat(2_000);
        let outcome = JobOutcome::failure(&long, Duration::from_millis(10), 0);
        assert_eq!(outcome.error.unwrap().len(), MAX_ERROR_LEN);
    }
}
