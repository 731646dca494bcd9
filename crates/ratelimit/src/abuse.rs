//! Abuse detection over the per-client request history.
//!
//! Each registered pattern inspects the bounded history window and returns a
//! severity score when it fires; scores sum and are clamped to 1.0. The
//! limiter escalates to a temporary block above 0.7 and a slowdown above 0.3.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A suspicious-traffic pattern.
pub trait AbusePattern: Send + Sync {
    fn name(&self) -> &str;

    /// Severity in `(0, 1]` when the pattern fires, `None` otherwise.
    fn score(&self, history: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> Option<f64>;
}

/// Fires when more than `threshold` requests fall within `window` of now.
#[derive(Debug, Clone)]
pub struct BurstPattern {
    pub threshold: usize,
    pub window: Duration,
    pub severity: f64,
}

impl Default for BurstPattern {
    fn default() -> Self {
        Self {
            threshold: 30,
            window: Duration::from_secs(10),
            severity: 0.5,
        }
    }
}

impl AbusePattern for BurstPattern {
    fn name(&self) -> &str {
        "burst"
    }

    fn score(&self, history: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_default();
        let recent = history.iter().filter(|ts| **ts > cutoff).count();
        (recent > self.threshold).then_some(self.severity)
    }
}

/// Fires when inter-request interval variance falls below a threshold — the
/// classic automation signature. Requires at least 10 samples.
#[derive(Debug, Clone)]
pub struct ConstantRatePattern {
    /// Variance threshold in seconds² below which traffic looks scripted
    pub variance_threshold: f64,
    pub severity: f64,
}

impl Default for ConstantRatePattern {
    fn default() -> Self {
        Self {
            variance_threshold: 0.01,
            severity: 0.4,
        }
    }
}

const MIN_SAMPLES: usize = 10;

impl AbusePattern for ConstantRatePattern {
    fn name(&self) -> &str {
        "constant_rate"
    }

    fn score(&self, history: &VecDeque<DateTime<Utc>>, _now: DateTime<Utc>) -> Option<f64> {
        if history.len() < MIN_SAMPLES {
            return None;
        }

        let intervals: Vec<f64> = history
            .iter()
            .zip(history.iter().skip(1))
            .map(|(a, b)| (*b - *a).num_milliseconds() as f64 / 1_000.0)
            .collect();

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance = intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;

        (variance < self.variance_threshold).then_some(self.severity)
    }
}

/// Runs all registered patterns and sums their severities.
pub struct AbuseDetector {
    patterns: Vec<Box<dyn AbusePattern>>,
}

impl Default for AbuseDetector {
    fn default() -> Self {
        Self {
            patterns: vec![
                Box::new(BurstPattern::default()),
                Box::new(ConstantRatePattern::default()),
            ],
        }
    }
}

impl AbuseDetector {
    pub fn new(patterns: Vec<Box<dyn AbusePattern>>) -> Self {
        Self { patterns }
    }

    /// Total abuse score for the given history, clamped to `[0, 1]`.
    pub fn analyze(&self, history: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        let mut total = 0.0;
        for pattern in &self.patterns {
            if let Some(severity) = pattern.score(history, now) {
                tracing::debug!(pattern = pattern.name(), severity, "abuse pattern fired");
                total += severity;
            }
        }
        total.clamp(0.0, 1.0)
    }
}
