//! Load-based feature gating.
//!
//! A single process-wide load signal in `[0, 1]` is published by whatever
//! measures system pressure (queue depth, worker saturation); feature gates
//! read it lock-free on every request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Gates optional features on a shared load signal.
///
/// Each feature carries a threshold; the feature is enabled while the current
/// load is *below* its threshold. Features never registered are always
/// enabled. The load value is stored as `f64` bits in an atomic so readers
/// never contend.
pub struct GracefulDegradation {
    load_bits: AtomicU64,
    thresholds: HashMap<String, f64>,
}

impl Default for GracefulDegradation {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulDegradation {
    pub fn new() -> Self {
        Self {
            load_bits: AtomicU64::new(0.0f64.to_bits()),
            thresholds: HashMap::new(),
        }
    }

    /// Register a feature that shuts off once load reaches `threshold`.
    pub fn with_feature(mut self, name: impl Into<String>, threshold: f64) -> Self {
        self.thresholds.insert(name.into(), threshold.clamp(0.0, 1.0));
        self
    }

    /// Publish the current load, clamped to `[0, 1]`.
    pub fn set_load(&self, load: f64) {
        let clamped = load.clamp(0.0, 1.0);
        let previous = self.load();
        self.load_bits.store(clamped.to_bits(), Ordering::Relaxed);
        // Log threshold crossings, not every update.
        for (feature, threshold) in &self.thresholds {
            let was_enabled = previous < *threshold;
            let is_enabled = clamped < *threshold;
            if was_enabled != is_enabled {
                info!(feature = %feature, load = clamped, enabled = is_enabled, "feature gate flipped");
            }
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Whether a feature should run at the current load.
    pub fn is_enabled(&self, feature: &str) -> bool {
        match self.thresholds.get(feature) {
            Some(threshold) => self.load() < *threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> GracefulDegradation {
        GracefulDegradation::new()
            .with_feature("style_analysis", 0.7)
            .with_feature("auto_illustrations", 0.5)
            .with_feature("chapter_generation", 0.95)
    }

    #[test]
    fn features_shed_in_threshold_order() {
        let g = gates();
        assert!(g.is_enabled("style_analysis"));
        assert!(g.is_enabled("auto_illustrations"));
        assert!(g.is_enabled("chapter_generation"));

        g.set_load(0.6);
        assert!(g.is_enabled("style_analysis"));
        assert!(!g.is_enabled("auto_illustrations"));
        assert!(g.is_enabled("chapter_generation"));

        g.set_load(0.97);
        assert!(!g.is_enabled("style_analysis"));
        assert!(!g.is_enabled("chapter_generation"));
    }

    #[test]
    fn unknown_features_are_always_enabled() {
        let g = gates();
        g.set_load(1.0);
        assert!(g.is_enabled("export_pdf"));
    }

    #[test]
    fn load_is_clamped() {
        let g = gates();
        g.set_load(3.5);
        assert_eq!(g.load(), 1.0);
        g.set_load(-0.2);
        assert_eq!(g.load(), 0.0);
    }

    #[test]
    fn boundary_load_disables_feature() {
        let g = gates();
        // Enabled strictly below the threshold.
        g.set_load(0.5);
        assert!(!g.is_enabled("auto_illustrations"));
        g.set_load(0.49);
        assert!(g.is_enabled("auto_illustrations"));
    }
}
