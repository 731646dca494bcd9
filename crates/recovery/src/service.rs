//! The recovery service: retry with backoff, resuming from checkpoints.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use quillforge_core::ProjectId;

use crate::checkpoint::{Checkpoint, CheckpointStore, OperationId};
use crate::classifier::FailureKind;

/// Error surfaced by a generator closure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Retry policy for recoverable operations.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Exponential base applied per retry
    pub backoff_base: f64,
    /// Jitter factor: up to `jitter * delay` of uniform random extra delay,
    /// so simultaneous failures do not retry in lockstep
    pub jitter: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_base: 2.0,
            jitter: 0.25,
        }
    }
}

/// Result of driving one operation to completion (or giving up).
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Total generator invocations, including the first
    pub attempts: u32,
    pub operation_id: OperationId,
}

/// Drives generators through the retry-with-checkpoint loop.
///
/// The generator closure receives its operation id (so it can record
/// checkpoints as it produces output) and the latest checkpoint (if any) so a
/// retry resumes mid-output instead of regenerating from scratch. It returns
/// the *remainder* it produced; the service appends that as the final
/// checkpoint and assembles the full result from the chain.
pub struct RecoveryService {
    store: Arc<CheckpointStore>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(store: Arc<CheckpointStore>) -> Self {
        Self {
            store,
            config: RecoveryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Whether another attempt is worthwhile, given the number of retries
    /// already performed.
    pub fn can_recover(&self, kind: FailureKind, retries_done: u32) -> bool {
        retries_done < self.config.max_retries && self.store.classifier().is_retryable(kind)
    }

    /// Delay before retry number `retry` (0-based): exponential, capped at
    /// `max_delay`, plus up to `jitter * delay` of random extra.
    pub fn recovery_delay(&self, retry: u32) -> Duration {
        let exp = self.config.backoff_base.powi(retry.min(16) as i32);
        let capped = self.config.initial_delay.mul_f64(exp).min(self.config.max_delay);
        if self.config.jitter <= 0.0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.config.jitter);
        capped.mul_f64(1.0 + jitter)
    }

    /// Run `generator` until it succeeds or the retry budget is exhausted.
    ///
    /// Blocks the calling thread across backoff sleeps; callers wanting
    /// concurrency run this on a worker thread.
    pub fn execute_with_recovery<F>(
        &self,
        operation_type: &str,
        project_id: ProjectId,
        context: Value,
        generator: F,
    ) -> RecoveryOutcome
    where
        F: Fn(OperationId, Option<&Checkpoint>) -> Result<String, GenerationError>,
    {
        let operation_id = self.store.create_operation(operation_type, project_id, context);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            // start() only errors if the operation vanished, which cannot
            // happen while we hold its id and nothing cleans it up.
            let _ = self.store.start(operation_id);

            let resume_from = self
                .store
                .get(operation_id)
                .and_then(|op| op.latest_checkpoint().cloned());
            if let Some(cp) = &resume_from {
                info!(
                    operation_id = %operation_id,
                    sequence = cp.sequence,
                    progress = cp.progress,
                    "resuming from checkpoint"
                );
            }

            match generator(operation_id, resume_from.as_ref()) {
                Ok(remainder) => {
                    let _ = self.store.mark_completed(operation_id, remainder);
                    let result = self.store.partial_result(operation_id).unwrap_or_default();
                    info!(operation_id = %operation_id, attempts, "operation recovered successfully");
                    return RecoveryOutcome {
                        success: true,
                        result: Some(result),
                        error: None,
                        attempts,
                        operation_id,
                    };
                }
                Err(err) => {
                    let kind = self
                        .store
                        .mark_failed(operation_id, &err.message)
                        .unwrap_or(FailureKind::Unknown);
                    let retries_done = attempts - 1;

                    if !self.can_recover(kind, retries_done) {
                        let _ = self.store.abandon(operation_id);
                        warn!(
                            operation_id = %operation_id,
                            kind = kind.as_str(),
                            attempts,
                            "giving up on operation"
                        );
                        return RecoveryOutcome {
                            success: false,
                            result: None,
                            error: Some(err.message),
                            attempts,
                            operation_id,
                        };
                    }

                    let delay = self.recovery_delay(retries_done);
                    warn!(
                        operation_id = %operation_id,
                        kind = kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
