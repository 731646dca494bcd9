//! `quillforge-ratelimit` — admission control for the generation API.
//!
//! ## Design
//!
//! - Per-client multi-window counters (minute/hour/day) with independent
//!   rollover, plus a sliding burst window
//! - Tiered limits with endpoint overrides that can only *tighten* a tier's
//!   budget (pointwise minimum), never loosen it
//! - Abuse detection scoring burst and bot-like constant-interval traffic,
//!   escalating to temporary blocks whose duration grows with the score
//! - A process-wide load signal ([`GracefulDegradation`]) gating optional
//!   features under load — independent of the per-client state
//!
//! The limiter runs *before* any job is created; its denials are the first
//! line of backpressure.

pub mod abuse;
pub mod config;
pub mod degradation;
pub mod limiter;
pub mod state;

pub use abuse::{AbuseDetector, AbusePattern, BurstPattern, ConstantRatePattern};
pub use config::{EndpointOverride, RateLimitAction, RateLimitConfig, Tier};
pub use degradation::GracefulDegradation;
pub use limiter::{RateLimitResult, RateLimiter};
pub use state::ClientState;
