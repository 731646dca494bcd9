//! `quillforge-recovery` — checkpointed retry for long-running generation.
//!
//! ## Design
//!
//! - Failures are classified from error text into [`FailureKind`]s; only some
//!   kinds are worth retrying
//! - Long generations checkpoint partial output as they go; a retry resumes
//!   from the latest checkpoint instead of starting over
//! - Retry delays grow exponentially with a random jitter so that a burst of
//!   failures does not retry in lockstep

pub mod checkpoint;
pub mod classifier;
pub mod service;

pub use checkpoint::{
    Checkpoint, CheckpointStore, OperationId, OperationState, RecoveryOperation,
};
pub use classifier::{FailureClassifier, FailureKind};
pub use service::{GenerationError, RecoveryConfig, RecoveryOutcome, RecoveryService};
