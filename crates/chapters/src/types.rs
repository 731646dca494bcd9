//! Chapter generation data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quillforge_core::ProjectId;
use quillforge_recovery::GenerationError;

/// Planned shape of one chapter, produced by the outline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub target_words: Option<u32>,
}

impl ChapterOutline {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            key_points: Vec::new(),
            target_words: None,
        }
    }
}

/// Everything a generator needs to write one chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRequest {
    pub project_id: ProjectId,
    pub chapter_number: u32,
    pub outline: ChapterOutline,
    pub style_guide: String,
    pub character_bible: String,
    /// The last two *completed* chapter texts, oldest first. A rolling
    /// window, never the full history.
    pub previous_chapters: Vec<String>,
}

/// The injected generation backend.
///
/// Implementations call the model provider; tests substitute canned text.
pub trait ChapterGenerator: Send + Sync {
    fn generate(&self, request: &ChapterRequest) -> Result<String, GenerationError>;
}

impl<F> ChapterGenerator for F
where
    F: Fn(&ChapterRequest) -> Result<String, GenerationError> + Send + Sync,
{
    fn generate(&self, request: &ChapterRequest) -> Result<String, GenerationError> {
        self(request)
    }
}

/// Lifecycle of one chapter within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterJobState {
    Pending,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl ChapterJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChapterJobState::Completed | ChapterJobState::Failed | ChapterJobState::Cancelled
        )
    }
}

/// One chapter's slot in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterJob {
    pub chapter_number: u32,
    pub title: String,
    pub state: ChapterJobState,
    pub content: Option<String>,
    pub error: Option<String>,
    /// Generator invocations, including the first
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChapterJob {
    pub fn pending(chapter_number: u32, title: impl Into<String>) -> Self {
        Self {
            chapter_number,
            title: title.into(),
            state: ChapterJobState::Pending,
            content: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall-clock generation time, once finished.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Snapshot of batch state, pushed to the progress callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub generating: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Fraction of chapters in a terminal state
    pub progress: f64,
    /// Extrapolated from the mean duration of completed chapters
    pub estimated_remaining: Option<Duration>,
}

impl BatchProgress {
    pub fn from_jobs(jobs: &[ChapterJob], max_parallel: usize) -> Self {
        let total = jobs.len();
        let mut pending = 0;
        let mut generating = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for job in jobs {
            match job.state {
                ChapterJobState::Pending => pending += 1,
                ChapterJobState::Generating => generating += 1,
                ChapterJobState::Completed => completed += 1,
                ChapterJobState::Failed => failed += 1,
                ChapterJobState::Cancelled => cancelled += 1,
            }
        }
        let terminal = completed + failed + cancelled;
        let progress = if total == 0 {
            1.0
        } else {
            terminal as f64 / total as f64
        };

        let durations: Vec<Duration> = jobs
            .iter()
            .filter(|j| j.state == ChapterJobState::Completed)
            .filter_map(|j| j.duration())
            .collect();
        let estimated_remaining = if durations.is_empty() || total == terminal {
            None
        } else {
            let mean = durations.iter().sum::<Duration>() / durations.len() as u32;
            let outstanding = (pending + generating) as u32;
            // Outstanding work proceeds max_parallel chapters at a time.
            let waves = outstanding.div_ceil(max_parallel.max(1) as u32);
            Some(mean * waves)
        };

        Self {
            total,
            pending,
            generating,
            completed,
            failed,
            cancelled,
            progress,
            estimated_remaining,
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.generating == 0
    }
}
