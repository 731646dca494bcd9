//! `quillforge-core` — shared domain primitives.
//!
//! This crate contains the identifiers and error model shared by the
//! orchestration crates (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ProjectId, UserId};
