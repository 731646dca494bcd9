//! Checkpointed operation tracking.
//!
//! Every recoverable generation is tracked as a [`RecoveryOperation`] holding
//! an ordered list of checkpoints. A retry resumes from the latest checkpoint
//! and the concatenated partial results form the output produced so far.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quillforge_core::{DomainError, DomainResult, ProjectId};

use crate::classifier::{FailureClassifier, FailureKind};

/// Errors stored on operations are truncated to this many characters.
const MAX_ERROR_LEN: usize = 500;

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    error.chars().take(MAX_ERROR_LEN).collect()
}

/// Identifier of one recoverable operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// UUIDv7, time-ordered like the rest of the system's identifiers.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OperationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for OperationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("OperationId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Lifecycle of a recoverable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    /// At least one checkpoint has been recorded
    Checkpointed,
    Completed,
    Failed,
    /// Given up on; kept only for inspection until cleanup
    Abandoned,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Abandoned
        )
    }
}

/// One saved unit of partial progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Dense sequence number, starting at 0
    pub sequence: u32,
    pub partial_result: String,
    /// Fraction complete in `[0, 1]` as reported by the generator
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

/// A tracked operation and everything recorded about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOperation {
    pub id: OperationId,
    pub operation_type: String,
    pub project_id: ProjectId,
    pub state: OperationState,
    pub checkpoints: Vec<Checkpoint>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryOperation {
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// All partial results concatenated in checkpoint order.
    pub fn partial_result(&self) -> String {
        self.checkpoints
            .iter()
            .map(|c| c.partial_result.as_str())
            .collect()
    }

    /// Highest progress recorded so far (progress never moves backwards even
    /// if a generator reports a smaller number).
    pub fn progress(&self) -> f64 {
        self.checkpoints
            .iter()
            .map(|c| c.progress)
            .fold(0.0, f64::max)
    }
}

/// In-memory store of recoverable operations.
///
/// Shared between the recovery service (writes) and status endpoints (reads).
pub struct CheckpointStore {
    operations: Mutex<HashMap<OperationId, RecoveryOperation>>,
    classifier: FailureClassifier,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            classifier: FailureClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Register a new operation in `Pending` state.
    pub fn create_operation(
        &self,
        operation_type: impl Into<String>,
        project_id: ProjectId,
        context: Value,
    ) -> OperationId {
        let id = OperationId::new();
        let now = Utc::now();
        let operation = RecoveryOperation {
            id,
            operation_type: operation_type.into(),
            project_id,
            state: OperationState::Pending,
            checkpoints: Vec::new(),
            retry_count: 0,
            last_error: None,
            failure_kind: None,
            context,
            created_at: now,
            updated_at: now,
        };
        debug!(operation_id = %id, operation_type = %operation.operation_type, "operation created");
        self.operations.lock().unwrap().insert(id, operation);
        id
    }

    /// Mark an operation as actively running.
    pub fn start(&self, id: OperationId) -> DomainResult<()> {
        self.update(id, |op| {
            op.state = OperationState::InProgress;
            Ok(())
        })
    }

    /// Record a checkpoint. Returns the assigned sequence number.
    pub fn checkpoint(
        &self,
        id: OperationId,
        partial_result: impl Into<String>,
        progress: f64,
        metadata: Value,
    ) -> DomainResult<u32> {
        self.update(id, |op| {
            let sequence = op.checkpoints.len() as u32;
            op.checkpoints.push(Checkpoint {
                sequence,
                partial_result: partial_result.into(),
                progress: progress.clamp(0.0, 1.0),
                created_at: Utc::now(),
                metadata,
            });
            op.state = OperationState::Checkpointed;
            debug!(operation_id = %id, sequence, progress, "checkpoint recorded");
            Ok(sequence)
        })
    }

    /// Complete an operation. A final checkpoint carrying `final_result` is
    /// appended at progress 1.0 before the state flips to `Completed`, so the
    /// full output is always recoverable from the checkpoint chain alone.
    pub fn mark_completed(
        &self,
        id: OperationId,
        final_result: impl Into<String>,
    ) -> DomainResult<()> {
        self.update(id, |op| {
            let sequence = op.checkpoints.len() as u32;
            op.checkpoints.push(Checkpoint {
                sequence,
                partial_result: final_result.into(),
                progress: 1.0,
                created_at: Utc::now(),
                metadata: serde_json::json!({ "final": true }),
            });
            op.state = OperationState::Completed;
            info!(operation_id = %id, checkpoints = op.checkpoints.len(), "operation completed");
            Ok(())
        })
    }

    /// Record a failure: classify it, truncate the stored message, and bump
    /// the retry count. Returns the classified kind.
    pub fn mark_failed(&self, id: OperationId, error: &str) -> DomainResult<FailureKind> {
        let kind = self.classifier.classify(error);
        self.update(id, |op| {
            op.state = OperationState::Failed;
            op.last_error = Some(truncate_error(error));
            op.failure_kind = Some(kind);
            op.retry_count += 1;
            warn!(
                operation_id = %id,
                kind = kind.as_str(),
                retry_count = op.retry_count,
                "operation failed"
            );
            Ok(kind)
        })
    }

    /// Give up on an operation without discarding what it produced.
    pub fn abandon(&self, id: OperationId) -> DomainResult<()> {
        self.update(id, |op| {
            op.state = OperationState::Abandoned;
            warn!(operation_id = %id, retry_count = op.retry_count, "operation abandoned");
            Ok(())
        })
    }

    pub fn get(&self, id: OperationId) -> Option<RecoveryOperation> {
        self.operations.lock().unwrap().get(&id).cloned()
    }

    /// Concatenated partial output of an operation.
    pub fn partial_result(&self, id: OperationId) -> DomainResult<String> {
        let operations = self.operations.lock().unwrap();
        let op = operations.get(&id).ok_or(DomainError::NotFound)?;
        Ok(op.partial_result())
    }

    /// Highest recorded progress for an operation.
    pub fn progress(&self, id: OperationId) -> DomainResult<f64> {
        let operations = self.operations.lock().unwrap();
        let op = operations.get(&id).ok_or(DomainError::NotFound)?;
        Ok(op.progress())
    }

    /// Remove terminal operations last touched more than `max_age` ago.
    /// Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut operations = self.operations.lock().unwrap();
        let before = operations.len();
        operations.retain(|_, op| !(op.state.is_terminal() && op.updated_at < cutoff));
        let removed = before - operations.len();
        if removed > 0 {
            debug!(removed, "cleaned up terminal operations");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().unwrap().is_empty()
    }

    fn update<T>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut RecoveryOperation) -> DomainResult<T>,
    ) -> DomainResult<T> {
        let mut operations = self.operations.lock().unwrap();
        let op = operations.get_mut(&id).ok_or(DomainError::NotFound)?;
        let result = f(op)?;
        op.updated_at = Utc::now();
        Ok(result)
    }
}
