//! `quillforge-chapters` — parallel chapter generation.
//!
//! ## Design
//!
//! - A simple FIFO scheduler (no priorities) with a `max_parallel` cap; the
//!   loop waits for the *first* finished task and immediately backfills
//! - Rolling context: each dispatched chapter receives the last two completed
//!   chapter texts, bounding prompt size regardless of book length
//! - Per-chapter retries with a fixed short delay; a chapter that exhausts
//!   its retries is marked failed without aborting the batch
//! - Batch progress is recomputed and pushed to an optional callback after
//!   every state change

pub mod service;
pub mod types;


pub use service::ParallelChapterService;
pub use types::{
    BatchProgress, ChapterGenerator, ChapterJob, ChapterJobState, ChapterOutline, ChapterRequest,
};
