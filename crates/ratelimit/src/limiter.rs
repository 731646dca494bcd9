//! The admission-control entry point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::abuse::AbuseDetector;
use crate::config::{resolve, EndpointOverride, RateLimitAction, RateLimitConfig, Tier};
use crate::state::ClientState;

/// Abuse score above which the client is temporarily blocked.
const BLOCK_THRESHOLD: f64 = 0.7;
/// Abuse score above which a non-blocking slowdown is reported.
const SLOWDOWN_THRESHOLD: f64 = 0.3;

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_minute: u32,
    pub remaining_hour: u32,
    pub remaining_day: u32,
    pub retry_after_seconds: Option<u64>,
    pub slowdown_seconds: Option<f64>,
    pub reason: Option<String>,
}

impl RateLimitResult {
    /// Transport-layer header propagation.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-RateLimit-Remaining-Minute".to_string(), self.remaining_minute.to_string()),
            ("X-RateLimit-Remaining-Hour".to_string(), self.remaining_hour.to_string()),
            ("X-RateLimit-Remaining-Day".to_string(), self.remaining_day.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_seconds {
            headers.push(("Retry-After".to_string(), retry_after.to_string()));
        }
        headers
    }
}

/// Per-client admission control: multi-window counters, burst detection, and
/// abuse scoring.
///
/// Construct one limiter at process start and inject it wherever admission is
/// checked; all per-client state lives behind an internal mutex held only for
/// the synchronous bookkeeping of a single check.
pub struct RateLimiter {
    clients: Mutex<HashMap<String, ClientState>>,
    overrides: Vec<EndpointOverride>,
    detector: AbuseDetector,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            overrides: Vec::new(),
            detector: AbuseDetector::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<EndpointOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_detector(mut self, detector: AbuseDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Admission check, executed once per incoming request.
    pub fn check(&self, client_id: &str, tier: Tier, endpoint: &str) -> RateLimitResult {
        self.check_at(client_id, tier, endpoint, Utc::now())
    }

    /// [`check`](Self::check) against an explicit clock, used by tests to
    /// exercise window rollover without sleeping.
    pub fn check_at(
        &self,
        client_id: &str,
        tier: Tier,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let config = resolve(tier, endpoint, &self.overrides);

        let mut clients = self.clients.lock().unwrap();
        let state = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientState::new(now));
        state.roll_windows(now);

        // Active block short-circuits everything else.
        if let Some(until) = state.blocked_until {
            if now < until {
                let retry_after = (until - now).num_seconds().max(1) as u64;
                debug!(client_id, retry_after, "request denied: client blocked");
                return denied(state, &config, retry_after, "Temporarily blocked");
            }
            state.blocked_until = None;
        }

        state.record_request(now);

        // Count the request against every window up front so denied
        // responses report the same remaining budget as allowed ones.
        state.minute_count += 1;
        state.hour_count += 1;
        state.day_count += 1;

        // Burst window.
        state.burst_timestamps.push(now);
        state.prune_burst(now, config.burst_window);
        if state.burst_timestamps.len() as u32 > config.burst_limit {
            debug!(client_id, burst = state.burst_timestamps.len(), "request denied: burst");
            let retry_after = config.burst_window.as_secs().max(1);
            return denied(state, &config, retry_after, "Burst limit exceeded");
        }

        // Fixed windows, checked in order; the first violation decides.
        let violation = if state.minute_count > config.requests_per_minute {
            Some(("minute", state.minute_reset))
        } else if state.hour_count > config.requests_per_hour {
            Some(("hour", state.hour_reset))
        } else if state.day_count > config.requests_per_day {
            Some(("day", state.day_reset))
        } else {
            None
        };

        let mut slowdown: Option<f64> = None;
        if let Some((window, reset_at)) = violation {
            match config.action {
                RateLimitAction::Block => {
                    let retry_after = (reset_at - now).num_seconds().max(1) as u64;
                    debug!(client_id, window, retry_after, "request denied: window limit");
                    return denied(
                        state,
                        &config,
                        retry_after,
                        &format!("Rate limit exceeded ({window})"),
                    );
                }
                RateLimitAction::SlowDown => {
                    slowdown = Some(config.slowdown_factor);
                }
                RateLimitAction::LogOnly => {
                    warn!(client_id, window, "rate limit exceeded (log only)");
                }
            }
        }

        // Abuse analysis over the recent-request history.
        let score = self.detector.analyze(&state.history, now);
        state.abuse_score = score;
        if score > BLOCK_THRESHOLD {
            let block_secs = (60.0 * score * 10.0) as i64;
            state.blocked_until = Some(now + chrono::Duration::seconds(block_secs));
            info!(client_id, score, block_secs, "abusive client blocked");
            return denied(
                state,
                &config,
                block_secs.max(1) as u64,
                "Suspicious traffic pattern detected",
            );
        }
        if score > SLOWDOWN_THRESHOLD {
            let abuse_slowdown = score * config.slowdown_factor;
            slowdown = Some(slowdown.map_or(abuse_slowdown, |s| s.max(abuse_slowdown)));
        }

        RateLimitResult {
            allowed: true,
            remaining_minute: config.requests_per_minute.saturating_sub(state.minute_count),
            remaining_hour: config.requests_per_hour.saturating_sub(state.hour_count),
            remaining_day: config.requests_per_day.saturating_sub(state.day_count),
            retry_after_seconds: None,
            slowdown_seconds: slowdown,
            reason: None,
        }
    }

    /// Current abuse score for a client (0 when unknown).
    pub fn abuse_score(&self, client_id: &str) -> f64 {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map_or(0.0, |s| s.abuse_score)
    }

    /// Evict clients idle for longer than `max_idle`. Returns the number of
    /// clients removed.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_idle).unwrap_or_default();
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|_, state| state.last_seen >= cutoff);
        let removed = before - clients.len();
        if removed > 0 {
            debug!(removed, "evicted idle rate-limit clients");
        }
        removed
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

fn denied(
    state: &ClientState,
    config: &RateLimitConfig,
    retry_after: u64,
    reason: &str,
) -> RateLimitResult {
    RateLimitResult {
        allowed: false,
        remaining_minute: config.requests_per_minute.saturating_sub(state.minute_count),
        remaining_hour: config.requests_per_hour.saturating_sub(state.hour_count),
        remaining_day: config.requests_per_day.saturating_sub(state.day_count),
        retry_after_seconds: Some(retry_after),
        slowdown_seconds: None,
        reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::{AbusePattern, BurstPattern};
    use std::collections::VecDeque;

    const ENDPOINT: &str = "/v1/chapters/generate";

    fn tight_config(action: RateLimitAction) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: 5,
            requests_per_hour: 1_000,
            requests_per_day: 10_000,
            burst_limit: 100,
            burst_window: Duration::from_secs(1),
            action,
            slowdown_factor: 2.0,
        }
    }

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new()
            .with_overrides(vec![EndpointOverride::new(ENDPOINT, config)])
            // No abuse patterns: these tests exercise windows only.
            .with_detector(AbuseDetector::new(Vec::new()))
    }

    #[test]
    fn sixth_request_in_minute_is_denied_then_window_rolls_over() {
        let limiter = limiter_with(tight_config(RateLimitAction::Block));
        let t0 = Utc::now();

        for i in 0..5 {
            let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(i));
            assert!(result.allowed, "request {i} should be allowed");
        }
        let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(5));
        assert!(!result.allowed);
        assert_eq!(result.remaining_minute, 0);
        assert!(result.retry_after_seconds.unwrap() >= 1);
        assert!(result.reason.unwrap().contains("minute"));

        // After the minute window elapses the client is admitted again.
        let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(61));
        assert!(result.allowed);
    }

    #[test]
    fn burst_limit_denies_regardless_of_minute_budget() {
        let mut config = tight_config(RateLimitAction::Block);
        config.requests_per_minute = 1_000;
        config.burst_limit = 2;
        let limiter = limiter_with(config);
        let t0 = Utc::now();

        let r1 = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0);
        let r2 = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(100));
        let r3 = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(200));

        assert!(r1.allowed);
        assert!(r2.allowed);
        assert!(!r3.allowed);
        assert_eq!(r3.reason.as_deref(), Some("Burst limit exceeded"));
    }

    #[test]
    fn burst_denial_counts_the_request_against_the_windows() {
        let mut config = tight_config(RateLimitAction::Block);
        config.requests_per_minute = 10;
        config.burst_limit = 2;
        let limiter = limiter_with(config);
        let t0 = Utc::now();

        limiter.check_at("c1", Tier::Pro, ENDPOINT, t0);
        limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(100));
        let denied = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(200));

        assert!(!denied.allowed);
        // The denied request itself is counted, same as a window denial.
        assert_eq!(denied.remaining_minute, 7);
    }

    #[test]
    fn burst_window_slides() {
        let mut config = tight_config(RateLimitAction::Block);
        config.requests_per_minute = 1_000;
        config.burst_limit = 2;
        let limiter = limiter_with(config);
        let t0 = Utc::now();

        assert!(limiter.check_at("c1", Tier::Pro, ENDPOINT, t0).allowed);
        assert!(limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(100)).allowed);
        // Two seconds later the earlier timestamps are outside the window.
        assert!(limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(2)).allowed);
    }

    #[test]
    fn slow_down_action_allows_with_delay() {
        let limiter = limiter_with(tight_config(RateLimitAction::SlowDown));
        let t0 = Utc::now();

        for i in 0..5 {
            let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(i));
            assert!(result.allowed);
            assert!(result.slowdown_seconds.is_none());
        }
        let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(5));
        assert!(result.allowed);
        assert_eq!(result.slowdown_seconds, Some(2.0));
    }

    #[test]
    fn log_only_action_allows_silently() {
        let limiter = limiter_with(tight_config(RateLimitAction::LogOnly));
        let t0 = Utc::now();

        for i in 0..8 {
            let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(i));
            assert!(result.allowed);
        }
    }

    #[test]
    fn clients_are_tracked_independently() {
        let limiter = limiter_with(tight_config(RateLimitAction::Block));
        let t0 = Utc::now();

        for i in 0..6 {
            limiter.check_at("noisy", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(i * 10));
        }
        // A different client still has its full budget.
        let result = limiter.check_at("quiet", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(1));
        assert!(result.allowed);
        assert_eq!(result.remaining_minute, 4);
    }

    #[test]
    fn high_abuse_score_blocks_with_escalating_duration() {
        let config = RateLimitConfig {
            requests_per_minute: 1_000,
            requests_per_hour: 10_000,
            requests_per_day: 100_000,
            burst_limit: 1_000,
            burst_window: Duration::from_secs(10),
            action: RateLimitAction::Block,
            slowdown_factor: 2.0,
        };
        let limiter = RateLimiter::new()
            .with_overrides(vec![EndpointOverride::new(ENDPOINT, config)])
            .with_detector(AbuseDetector::new(vec![Box::new(BurstPattern {
                threshold: 5,
                window: Duration::from_secs(10),
                severity: 0.8,
            })]));
        let t0 = Utc::now();

        let mut denied_at = None;
        for i in 0..10 {
            let now = t0 + chrono::Duration::milliseconds(i * 50);
            let result = limiter.check_at("bot", Tier::Pro, ENDPOINT, now);
            if !result.allowed {
                assert_eq!(result.reason.as_deref(), Some("Suspicious traffic pattern detected"));
                // Block duration scales with the score: 60 * 0.8 * 10.
                assert_eq!(result.retry_after_seconds, Some(480));
                denied_at = Some(now);
                break;
            }
        }
        let denied_at = denied_at.expect("abuse block should have triggered");
        assert!(limiter.abuse_score("bot") > 0.7);

        // Still blocked shortly after; admitted once the block expires.
        let result = limiter.check_at("bot", Tier::Pro, ENDPOINT, denied_at + chrono::Duration::seconds(10));
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("Temporarily blocked"));

        let result = limiter.check_at("bot", Tier::Pro, ENDPOINT, denied_at + chrono::Duration::seconds(481));
        assert!(result.allowed);
    }

    #[test]
    fn mild_abuse_score_reports_slowdown() {
        struct Mild;
        impl AbusePattern for Mild {
            fn name(&self) -> &str {
                "mild"
            }
            fn score(&self, _: &VecDeque<DateTime<Utc>>, _: DateTime<Utc>) -> Option<f64> {
                Some(0.4)
            }
        }

        let limiter = limiter_with(tight_config(RateLimitAction::Block))
            .with_detector(AbuseDetector::new(vec![Box::new(Mild)]));
        let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, Utc::now());
        assert!(result.allowed);
        assert_eq!(result.slowdown_seconds, Some(0.8)); // 0.4 * slowdown_factor 2.0
    }

    #[test]
    fn headers_carry_remaining_and_retry_after() {
        let limiter = limiter_with(tight_config(RateLimitAction::Block));
        let t0 = Utc::now();

        let result = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0);
        let headers = result.to_headers();
        assert!(headers.contains(&("X-RateLimit-Remaining-Minute".to_string(), "4".to_string())));
        assert!(!headers.iter().any(|(k, _)| k == "Retry-After"));

        for i in 1..6 {
            limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::milliseconds(i * 10));
        }
        let denied = limiter.check_at("c1", Tier::Pro, ENDPOINT, t0 + chrono::Duration::seconds(1));
        assert!(!denied.allowed);
        assert!(denied.to_headers().iter().any(|(k, _)| k == "Retry-After"));
    }

    #[test]
    fn idle_clients_are_evicted() {
        let limiter = limiter_with(tight_config(RateLimitAction::Block));
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        limiter.check_at("stale", Tier::Free, ENDPOINT, long_ago);
        limiter.check_at("fresh", Tier::Free, ENDPOINT, Utc::now());
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.cleanup_idle(Duration::from_secs(3_600)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
