//! `quillforge-jobs` — priority job queue and bounded worker pool.
//!
//! ## Design
//!
//! - Jobs are project-scoped and typed; handlers are registered per job type
//! - Strict `(priority, created_at)` dequeue order via a min-heap
//! - Lazy purge of cancelled/expired jobs at dequeue time (O(1) cancellation)
//! - Per-job retry with exponential backoff; exhausted jobs stay `Failed`
//! - `enqueue` rejects past `max_size` tracked jobs (backpressure)
//!
//! ## Components
//!
//! - `Job`: unit of work with payload, priority, timeout, and retry budget
//! - `PriorityQueue`: ordered container + status index for all tracked jobs
//! - `Worker`/`WorkerPool`: fixed-size set of execution loops with timeout
//!   enforcement and failure routing back to the queue

pub mod queue;
pub mod types;
pub mod worker;

pub use queue::{PriorityQueue, QueueStats};
pub use types::{Job, JobError, JobId, JobOutcome, JobStatus, Priority};
pub use worker::{JobHandler, PoolStats, WorkerConfig, WorkerPool};
