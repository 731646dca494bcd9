//! Priority-ordered job queue with status indexing.
//!
//! Queued jobs are ordered by `(priority, created_at)` in a min-heap; an
//! insertion counter breaks ties between jobs created in the same instant so
//! ordering stays deterministic. Cancelled and expired jobs are purged lazily
//! at dequeue time: `cancel` only flips the status and never restructures the
//! heap, trading O(log n) removal for O(1) cancellation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{Job, JobId, JobOutcome, JobStatus, Priority};

/// Heap key: min on `(priority, created_at, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    jobs: HashMap<JobId, Job>,
    seq: u64,
}

impl QueueInner {
    fn push_entry(&mut self, job: &Job) {
        self.seq += 1;
        self.heap.push(Reverse(HeapEntry {
            priority: job.priority,
            created_at: job.created_at,
            seq: self.seq,
            job_id: job.id,
        }));
    }
}

/// Counts of tracked jobs by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
    pub expired: usize,
}

/// In-memory priority job queue.
///
/// All bookkeeping happens under one mutex held only across synchronous map
/// and heap operations, never across handler invocations or sleeps.
#[derive(Debug)]
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    max_size: usize,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_size,
        }
    }

    /// Enqueue a job, transitioning it to `Queued`.
    ///
    /// Returns `false` once the queue tracks `max_size` jobs (queued, running,
    /// and terminal-not-yet-cleaned all count) — this is the backpressure
    /// signal to the admission layer.
    pub fn enqueue(&self, mut job: Job) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.len() >= self.max_size {
            warn!(job_id = %job.id, max_size = self.max_size, "queue full, rejecting job");
            return false;
        }
        job.mark_queued();
        inner.push_entry(&job);
        debug!(job_id = %job.id, job_type = %job.job_type, priority = ?job.priority, "job enqueued");
        inner.jobs.insert(job.id, job);
        true
    }

    /// Dequeue the most urgent queued job, marking it `Running`.
    pub fn dequeue(&self) -> Option<Job> {
        self.claim_inner(None)
    }

    /// Dequeue on behalf of a worker, stamping its id on the job.
    pub fn claim(&self, worker_id: u32) -> Option<Job> {
        self.claim_inner(Some(worker_id))
    }

    fn claim_inner(&self, worker_id: Option<u32>) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        // Lazy purge: pop until we find a live queued entry. Entries whose job
        // was cancelled, expired, or cleaned up are discarded here.
        while let Some(Reverse(entry)) = inner.heap.pop() {
            let Some(job) = inner.jobs.get_mut(&entry.job_id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            if job.is_expired(now) {
                job.mark_expired();
                debug!(job_id = %job.id, "discarding expired job");
                continue;
            }
            job.mark_running(worker_id);
            return Some(job.clone());
        }
        None
    }

    /// Cancel a not-yet-finished job.
    ///
    /// Returns `false` for jobs already in a terminal status. A running job is
    /// flipped to `Cancelled` but its in-flight attempt is not interrupted;
    /// cancellation only prevents future execution.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.mark_cancelled();
                debug!(job_id = %job_id, "job cancelled");
                true
            }
            _ => false,
        }
    }

    /// Record a successful attempt, transitioning `Running → Completed`.
    pub fn complete(&self, job_id: JobId, data: Option<serde_json::Value>, duration: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                let outcome = JobOutcome::success(data, duration, job.retry_count);
                job.mark_completed(outcome);
                debug!(job_id = %job_id, "job completed");
                true
            }
            _ => false,
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` if the job still has retry budget (status becomes
    /// `Retrying`; the caller is expected to back off and `requeue`), `false`
    /// if it is now permanently `Failed`.
    pub fn fail(&self, job_id: JobId, error: &str, duration: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                let outcome = JobOutcome::failure(error, duration, job.retry_count);
                if job.retry_count < job.max_retries {
                    job.mark_retrying(outcome);
                    debug!(job_id = %job_id, retry_count = job.retry_count, error = %error, "job will retry");
                    true
                } else {
                    job.mark_failed(error, outcome);
                    warn!(job_id = %job_id, attempts = job.retry_count + 1, error = %error, "job failed permanently");
                    false
                }
            }
            _ => false,
        }
    }

    /// Record a failure that must never be retried (e.g. no handler exists
    /// for the job type).
    pub fn fail_permanent(&self, job_id: JobId, error: &str, duration: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                let outcome = JobOutcome::failure(error, duration, job.retry_count);
                job.mark_failed(error, outcome);
                warn!(job_id = %job_id, error = %error, "job failed permanently (not retriable)");
                true
            }
            _ => false,
        }
    }

    /// Re-insert a `Retrying` job, bumping its retry count.
    ///
    /// The same record is mutated and pushed back with its original
    /// `created_at`, so a retried job keeps its place among equal-priority
    /// peers.
    pub fn requeue(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status != JobStatus::Retrying {
            return false;
        }
        job.retry_count += 1;
        job.mark_queued();
        let job = job.clone();
        inner.push_entry(&job);
        debug!(job_id = %job_id, retry_count = job.retry_count, "job requeued");
        true
    }

    /// Snapshot of a tracked job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().unwrap().jobs.get(&job_id).cloned()
    }

    /// Jobs whose status matches `status` (payload fields ignored), ordered by
    /// creation time.
    pub fn get_by_status(&self, status: &JobStatus) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| std::mem::discriminant(&j.status) == std::mem::discriminant(status))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        result
    }

    /// Jobs of the given type, ordered by creation time.
    pub fn get_by_type(&self, job_type: &str) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        result
    }

    /// Counts of tracked jobs by status.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Number of jobs currently tracked (all statuses).
    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Drop terminal jobs whose last status change is older than `max_age`.
    /// Returns the number of jobs removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        let removed = before - inner.jobs.len();
        if removed > 0 {
            debug!(removed, "cleaned up terminal jobs");
        }
        removed
    }
}
