//! Rate-limit policy: tier defaults and endpoint overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subscription tier of the calling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// Baseline limits for this tier.
    pub fn default_config(&self) -> RateLimitConfig {
        match self {
            Tier::Free => RateLimitConfig {
                requests_per_minute: 20,
                requests_per_hour: 300,
                requests_per_day: 1_000,
                burst_limit: 5,
                burst_window: Duration::from_secs(10),
                action: RateLimitAction::Block,
                slowdown_factor: 2.0,
            },
            Tier::Pro => RateLimitConfig {
                requests_per_minute: 60,
                requests_per_hour: 2_000,
                requests_per_day: 20_000,
                burst_limit: 15,
                burst_window: Duration::from_secs(10),
                action: RateLimitAction::Block,
                slowdown_factor: 1.0,
            },
            Tier::Enterprise => RateLimitConfig {
                requests_per_minute: 240,
                requests_per_hour: 10_000,
                requests_per_day: 100_000,
                burst_limit: 50,
                burst_window: Duration::from_secs(10),
                action: RateLimitAction::SlowDown,
                slowdown_factor: 0.5,
            },
        }
    }
}

/// What to do when a window limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    /// Deny the request with a retry-after hint
    Block,
    /// Allow, but report a slowdown delay to the caller
    SlowDown,
    /// Allow and only log the violation
    LogOnly,
}

/// Static limits applied to one (tier, endpoint) resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub burst_limit: u32,
    pub burst_window: Duration,
    pub action: RateLimitAction,
    pub slowdown_factor: f64,
}

impl RateLimitConfig {
    /// Pointwise minimum of the numeric limits; `action` and
    /// `slowdown_factor` are kept from `self`.
    ///
    /// Endpoint overrides exist to tighten limits on expensive routes
    /// regardless of tier, so the combined policy is never looser than
    /// either input.
    pub fn min(&self, other: &Self) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute.min(other.requests_per_minute),
            requests_per_hour: self.requests_per_hour.min(other.requests_per_hour),
            requests_per_day: self.requests_per_day.min(other.requests_per_day),
            burst_limit: self.burst_limit.min(other.burst_limit),
            burst_window: self.burst_window,
            action: self.action,
            slowdown_factor: self.slowdown_factor,
        }
    }
}

/// Endpoint-specific limit override, matched by pattern.
///
/// Patterns are exact (`"/v1/chapters/generate"`) or trailing-`*` prefixes
/// (`"/v1/chapters/*"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    pub pattern: String,
    pub config: RateLimitConfig,
}

impl EndpointOverride {
    pub fn new(pattern: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            pattern: pattern.into(),
            config,
        }
    }

    pub fn matches(&self, endpoint: &str) -> bool {
        if self.pattern == endpoint {
            return true;
        }
        self.pattern.len() > 1
            && self.pattern.ends_with('*')
            && endpoint.starts_with(&self.pattern[..self.pattern.len() - 1])
    }
}

/// Resolve effective limits for a (tier, endpoint) pair: the pointwise
/// minimum of the tier baseline and the first matching override, with the
/// `action` taken from the override when one matches.
pub fn resolve(tier: Tier, endpoint: &str, overrides: &[EndpointOverride]) -> RateLimitConfig {
    let base = tier.default_config();
    match overrides.iter().find(|o| o.matches(endpoint)) {
        Some(o) => o.config.min(&base),
        None => base,
    }
}
