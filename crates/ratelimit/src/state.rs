//! Per-client rate-limit state.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Maximum number of recent request timestamps kept per client. The history
/// is only consumed by abuse analysis, so a small bounded window is enough.
pub const HISTORY_LIMIT: usize = 100;

/// Mutable counters and history for one client, created lazily on first
/// request and evicted by idle cleanup.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub minute_count: u32,
    pub hour_count: u32,
    pub day_count: u32,
    pub minute_reset: DateTime<Utc>,
    pub hour_reset: DateTime<Utc>,
    pub day_reset: DateTime<Utc>,
    /// Sliding burst window timestamps (pruned on every check)
    pub burst_timestamps: Vec<DateTime<Utc>>,
    /// Bounded recent-request history, used only for abuse analysis
    pub history: VecDeque<DateTime<Utc>>,
    /// Cumulative abuse score in `[0, 1]`
    pub abuse_score: f64,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl ClientState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute_count: 0,
            hour_count: 0,
            day_count: 0,
            minute_reset: now + chrono::Duration::seconds(60),
            hour_reset: now + chrono::Duration::seconds(3_600),
            day_reset: now + chrono::Duration::seconds(86_400),
            burst_timestamps: Vec::new(),
            history: VecDeque::new(),
            abuse_score: 0.0,
            blocked_until: None,
            last_seen: now,
        }
    }

    /// Reset any window whose deadline has elapsed. The new deadline is one
    /// full window from *now*, not from the old deadline — the drift is
    /// acceptable and keeps the bookkeeping simple.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now >= self.minute_reset {
            self.minute_count = 0;
            self.minute_reset = now + chrono::Duration::seconds(60);
        }
        if now >= self.hour_reset {
            self.hour_count = 0;
            self.hour_reset = now + chrono::Duration::seconds(3_600);
        }
        if now >= self.day_reset {
            self.day_count = 0;
            self.day_reset = now + chrono::Duration::seconds(86_400);
        }
    }

    /// Append to the bounded request history and update `last_seen`.
    pub fn record_request(&mut self, now: DateTime<Utc>) {
        self.history.push_back(now);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.last_seen = now;
    }

    /// Drop burst timestamps older than the burst window.
    pub fn prune_burst(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        self.burst_timestamps.retain(|ts| *ts > cutoff);
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_roll_over_independently() {
        let t0 = Utc::now();
        let mut state = ClientState::new(t0);
        state.minute_count = 10;
        state.hour_count = 50;
        state.day_count = 200;

        // 61 seconds later only the minute window has elapsed.
        let t1 = t0 + chrono::Duration::seconds(61);
        state.roll_windows(t1);
        assert_eq!(state.minute_count, 0);
        assert_eq!(state.hour_count, 50);
        assert_eq!(state.day_count, 200);
        assert!(state.minute_reset > t1);
    }

    #[test]
    fn history_is_bounded() {
        let t0 = Utc::now();
        let mut state = ClientState::new(t0);
        for i in 0..(HISTORY_LIMIT + 25) {
            state.record_request(t0 + chrono::Duration::milliseconds(i as i64));
        }
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        // Oldest entries were dropped first.
        assert_eq!(state.history.front().copied().unwrap(), t0 + chrono::Duration::milliseconds(25));
    }

    #[test]
    fn burst_pruning_keeps_recent_entries() {
        let t0 = Utc::now();
        let mut state = ClientState::new(t0);
        state.burst_timestamps.push(t0 - chrono::Duration::seconds(5));
        state.burst_timestamps.push(t0 - chrono::Duration::seconds(1));
        state.burst_timestamps.push(t0);

        state.prune_burst(t0, Duration::from_secs(2));
        assert_eq!(state.burst_timestamps.len(), 2);
    }

    #[test]
    fn block_expiry() {
        let t0 = Utc::now();
        let mut state = ClientState::new(t0);
        assert!(!state.is_blocked(t0));

        state.blocked_until = Some(t0 + chrono::Duration::seconds(30));
        assert!(state.is_blocked(t0));
        assert!(!state.is_blocked(t0 + chrono::Duration::seconds(31)));
    }
}
