//! Worker pool: fixed-size execution loops over a shared priority queue.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::queue::PriorityQueue;
use crate::types::{Job, JobError, JobId, JobOutcome, JobStatus};

/// Job handler function type. Handlers receive the job payload and return
/// result data or an error message.
pub type JobHandler =
    Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

type HandlerRegistry = Arc<RwLock<HashMap<String, JobHandler>>>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a worker sleeps when the queue is empty
    pub poll_interval: Duration,
    /// Base delay for retry backoff (`retry_delay * 2^retry_count`)
    pub retry_delay: Duration,
    /// Name prefix for worker threads and logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            retry_delay: Duration::from_millis(500),
            name: "job-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
}

/// Fixed-size worker pool over one shared [`PriorityQueue`].
///
/// Handlers are registered per job type; patterns ending in `*` match by
/// prefix (e.g. `"chapter.*"`), and a bare `"*"` is the wildcard fallback.
pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
    worker_count: u32,
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<PriorityQueue>, worker_count: u32, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            worker_count,
            shutdown: Vec::new(),
            joins: Vec::new(),
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    /// Register a handler for a job type (or pattern).
    pub fn register_handler<F>(&self, type_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(type_pattern.into(), Arc::new(handler));
    }

    /// Spawn the worker threads.
    pub fn start(&mut self) {
        for id in 0..self.worker_count {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let queue = self.queue.clone();
            let handlers = self.handlers.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();

            let join = thread::Builder::new()
                .name(format!("{}-{}", self.config.name, id))
                .spawn(move || {
                    worker_loop(id, queue, handlers, config, shutdown_rx, stats);
                })
                .expect("failed to spawn job worker thread");

            self.shutdown.push(shutdown_tx);
            self.joins.push(join);
        }
        info!(workers = self.worker_count, name = %self.config.name, "worker pool started");
    }

    /// Request graceful shutdown and join all workers.
    pub fn shutdown(mut self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        info!(name = %self.config.name, "worker pool stopped");
    }

    /// Enqueue a job for background execution. Returns `false` when the queue
    /// rejects it (full).
    pub fn submit(&self, job: Job) -> bool {
        self.queue.enqueue(job)
    }

    /// Enqueue a job and poll until it reaches a terminal status or `timeout`
    /// elapses. Returns `None` only on timeout (the job keeps running in the
    /// background); a queue rejection comes back as an immediate failed
    /// outcome.
    pub fn submit_and_wait(&self, job: Job, timeout: Duration) -> Option<JobOutcome> {
        let job_id = job.id;
        if !self.queue.enqueue(job) {
            return Some(JobOutcome::failure("job rejected: queue full", Duration::ZERO, 0));
        }
        self.wait_for(job_id, timeout)
    }

    /// Poll an already-submitted job until terminal or `timeout`.
    pub fn wait_for(&self, job_id: JobId, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.queue.get(job_id) {
                match &job.status {
                    JobStatus::Completed | JobStatus::Failed { .. } => return job.result,
                    JobStatus::Cancelled => {
                        return Some(JobOutcome::failure("job cancelled", Duration::ZERO, job.retry_count))
                    }
                    JobStatus::Expired => {
                        return Some(JobOutcome::failure("job expired", Duration::ZERO, job.retry_count))
                    }
                    _ => {}
                }
            } else {
                return None;
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap().clone()
    }

    /// The queue this pool executes from.
    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }
}

/// Look up the handler for a job type: exact match, then `prefix.*` patterns,
/// then the `"*"` wildcard.
fn lookup_handler(handlers: &HandlerRegistry, job_type: &str) -> Option<JobHandler> {
    let map = handlers.read().unwrap();
    if let Some(h) = map.get(job_type) {
        return Some(h.clone());
    }
    for (pattern, handler) in map.iter() {
        if pattern.len() > 1 && pattern.ends_with('*') && job_type.starts_with(&pattern[..pattern.len() - 1])
        {
            return Some(handler.clone());
        }
    }
    map.get("*").cloned()
}

/// Run a handler on a helper thread, bounding the wait to `timeout`.
///
/// On timeout the helper thread keeps running but its eventual result is
/// discarded; the attempt is recorded as failed. A dropped sender means the
/// handler panicked.
fn run_with_timeout(
    handler: JobHandler,
    payload: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, JobError> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("job-handler".to_string())
        .spawn(move || {
            let _ = tx.send(handler(&payload));
        });
    if spawned.is_err() {
        return Err(JobError::Handler("failed to spawn handler thread".to_string()));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(msg)) => Err(JobError::Handler(msg)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(JobError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(JobError::Panicked),
    }
}

fn worker_loop(
    worker_id: u32,
    queue: Arc<PriorityQueue>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PoolStats>>,
) {
    info!(worker = worker_id, "worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let Some(job) = queue.claim(worker_id) else {
            thread::sleep(config.poll_interval);
            continue;
        };
        debug!(worker = worker_id, job_id = %job.id, job_type = %job.job_type, "claimed job");

        {
            let mut s = stats.lock().unwrap();
            s.current_running += 1;
        }

        let started = Instant::now();
        let result = match lookup_handler(&handlers, &job.job_type) {
            Some(handler) => run_with_timeout(handler, job.payload.clone(), job.timeout),
            None => Err(JobError::MissingHandler(job.job_type.clone())),
        };
        let duration = started.elapsed();

        let succeeded = match result {
            Ok(data) => {
                queue.complete(job.id, Some(data), duration);
                true
            }
            Err(err @ JobError::MissingHandler(_)) => {
                // Hard failure: retrying cannot help until a handler exists.
                warn!(worker = worker_id, job_id = %job.id, error = %err, "no handler for job");
                queue.fail_permanent(job.id, &err.to_string(), duration);
                false
            }
            Err(err) => {
                let will_retry = queue.fail(job.id, &err.to_string(), duration);
                if will_retry {
                    let backoff =
                        config.retry_delay * 2u32.saturating_pow(job.retry_count.min(16));
                    debug!(
                        worker = worker_id,
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        "backing off before retry"
                    );
                    thread::sleep(backoff);
                    queue.requeue(job.id);
                }
                false
            }
        };

        let mut s = stats.lock().unwrap();
        s.current_running = s.current_running.saturating_sub(1);
        s.jobs_processed += 1;
        if succeeded {
            s.jobs_succeeded += 1;
        } else {
            s.jobs_failed += 1;
        }
    }

    info!(worker = worker_id, "worker stopped");
}
