//! Failure classification from error text.
//!
//! Upstream model providers and HTTP stacks report failures as strings; the
//! classifier maps them onto a small taxonomy that drives the retry decision.

use serde::{Deserialize, Serialize};

use quillforge_core::DomainError;

/// Coarse failure taxonomy for generation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ApiError,
    RateLimit,
    ValidationError,
    NetworkError,
    OutOfMemory,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ApiError => "api_error",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::ValidationError => "validation_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::OutOfMemory => "out_of_memory",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// Substring patterns checked in order; the first match wins. Rate-limit
/// markers come first because provider 429 bodies often also say "error".
const PATTERNS: &[(&str, FailureKind)] = &[
    ("rate limit", FailureKind::RateLimit),
    ("429", FailureKind::RateLimit),
    ("too many requests", FailureKind::RateLimit),
    ("timed out", FailureKind::Timeout),
    ("timeout", FailureKind::Timeout),
    ("deadline", FailureKind::Timeout),
    ("connection", FailureKind::NetworkError),
    ("network", FailureKind::NetworkError),
    ("dns", FailureKind::NetworkError),
    ("out of memory", FailureKind::OutOfMemory),
    ("oom", FailureKind::OutOfMemory),
    ("memory", FailureKind::OutOfMemory),
    ("500", FailureKind::ApiError),
    ("502", FailureKind::ApiError),
    ("503", FailureKind::ApiError),
    ("bad gateway", FailureKind::ApiError),
    ("service unavailable", FailureKind::ApiError),
    ("internal server error", FailureKind::ApiError),
    ("invalid", FailureKind::ValidationError),
    ("validation", FailureKind::ValidationError),
    ("malformed", FailureKind::ValidationError),
];

/// Classifies failures and decides which kinds are retryable.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    retryable: Vec<FailureKind>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            retryable: vec![
                FailureKind::Timeout,
                FailureKind::ApiError,
                FailureKind::RateLimit,
                FailureKind::NetworkError,
            ],
        }
    }
}

impl FailureClassifier {
    pub fn new(retryable: Vec<FailureKind>) -> Self {
        Self { retryable }
    }

    /// Map an error message onto the taxonomy.
    pub fn classify(&self, error: &str) -> FailureKind {
        let lower = error.to_lowercase();
        for (needle, kind) in PATTERNS {
            if lower.contains(needle) {
                return *kind;
            }
        }
        FailureKind::Unknown
    }

    /// Classification for structured domain errors, which carry their kind
    /// directly instead of hiding it in text.
    pub fn classify_domain(&self, error: &DomainError) -> FailureKind {
        match error {
            DomainError::Validation(_)
            | DomainError::InvalidId(_)
            | DomainError::InvariantViolation(_) => FailureKind::ValidationError,
            DomainError::NotFound => FailureKind::Unknown,
            DomainError::Conflict(_) => FailureKind::ApiError,
        }
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable.contains(&kind)
    }
}
