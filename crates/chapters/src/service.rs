//! FIFO chapter scheduling with a concurrency cap.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use quillforge_core::ProjectId;

use crate::types::{
    BatchProgress, ChapterGenerator, ChapterJob, ChapterJobState, ChapterOutline, ChapterRequest,
};

/// Errors stored on failed chapters are truncated to this many characters.
const MAX_ERROR_LEN: usize = 500;

/// Completed chapters carried forward as context for later ones.
const CONTEXT_WINDOW: usize = 2;

type ProgressCallback = Box<dyn Fn(BatchProgress) + Send + Sync>;

/// Runs a batch of chapter generations under a fixed concurrency cap.
///
/// Chapters dispatch in outline order (FIFO, no priorities). The scheduling
/// loop waits for the *first* task to finish and immediately backfills, so
/// the cap stays saturated until the tail of the batch. Each dispatched
/// chapter receives the last two completed chapter texts as rolling context.
pub struct ParallelChapterService {
    generator: Arc<dyn ChapterGenerator>,
    max_parallel: usize,
    max_retries: u32,
    retry_delay: Duration,
    progress_callback: Mutex<Option<ProgressCallback>>,
    cancelled: AtomicBool,
    pending_count: AtomicUsize,
}

impl ParallelChapterService {
    pub fn new(generator: Arc<dyn ChapterGenerator>, max_parallel: usize) -> Self {
        Self {
            generator,
            max_parallel: max_parallel.max(1),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            progress_callback: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            pending_count: AtomicUsize::new(0),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Install a callback invoked with a fresh [`BatchProgress`] after every
    /// chapter state change.
    pub fn set_progress_callback(&self, callback: impl Fn(BatchProgress) + Send + Sync + 'static) {
        *self.progress_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Request cancellation of the running batch. Chapters already
    /// generating run to completion; pending ones flip to `Cancelled`.
    /// Returns the number of chapters still pending at the time of the call.
    pub fn cancel(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        let pending = self.pending_count.load(Ordering::SeqCst);
        info!(pending, "chapter batch cancellation requested");
        pending
    }

    /// Generate one chapter per outline, blocking until the whole batch is
    /// terminal. Chapter numbers count up from `start_chapter`.
    pub fn generate_chapters(
        &self,
        project_id: ProjectId,
        outlines: Vec<ChapterOutline>,
        style_guide: &str,
        character_bible: &str,
        start_chapter: u32,
    ) -> Vec<ChapterJob> {
        self.cancelled.store(false, Ordering::SeqCst);
        let mut jobs: Vec<ChapterJob> = outlines
            .iter()
            .enumerate()
            .map(|(i, o)| ChapterJob::pending(start_chapter + i as u32, o.title.clone()))
            .collect();
        self.pending_count.store(jobs.len(), Ordering::SeqCst);
        info!(chapters = jobs.len(), max_parallel = self.max_parallel, "chapter batch started");

        // Completed texts in completion order; only the tail is ever sent.
        let mut completed_texts: Vec<String> = Vec::new();
        let (tx, rx) = mpsc::channel::<(usize, u32, Result<String, String>)>();
        let mut next = 0usize;
        let mut in_flight = 0usize;

        thread::scope(|scope| {
            loop {
                while in_flight < self.max_parallel
                    && next < jobs.len()
                    && !self.cancelled.load(Ordering::SeqCst)
                {
                    let request = ChapterRequest {
                        project_id,
                        chapter_number: jobs[next].chapter_number,
                        outline: outlines[next].clone(),
                        style_guide: style_guide.to_string(),
                        character_bible: character_bible.to_string(),
                        previous_chapters: completed_texts
                            .iter()
                            .rev()
                            .take(CONTEXT_WINDOW)
                            .rev()
                            .cloned()
                            .collect(),
                    };
                    jobs[next].state = ChapterJobState::Generating;
                    jobs[next].started_at = Some(Utc::now());
                    debug!(chapter = request.chapter_number, "chapter dispatched");

                    let generator = Arc::clone(&self.generator);
                    let task_tx = tx.clone();
                    let max_retries = self.max_retries;
                    let retry_delay = self.retry_delay;
                    let index = next;
                    scope.spawn(move || {
                        let mut attempts = 0u32;
                        let result = loop {
                            attempts += 1;
                            // A panicking generator must still report back,
                            // or the scheduling loop waits on this slot
                            // forever.
                            match catch_unwind(AssertUnwindSafe(|| generator.generate(&request))) {
                                Ok(Ok(text)) => break Ok(text),
                                Ok(Err(err)) if attempts > max_retries => break Err(err.message),
                                Ok(Err(_)) => thread::sleep(retry_delay),
                                Err(_) => break Err("chapter generation panicked".to_string()),
                            }
                        };
                        // The receiver outlives every task within the scope.
                        let _ = task_tx.send((index, attempts, result));
                    });

                    in_flight += 1;
                    next += 1;
                    self.pending_count.store(jobs.len() - next, Ordering::SeqCst);
                    self.push_progress(&jobs);
                }

                if self.cancelled.load(Ordering::SeqCst) && next < jobs.len() {
                    for job in &mut jobs[next..] {
                        job.state = ChapterJobState::Cancelled;
                    }
                    warn!(cancelled = jobs.len() - next, "pending chapters cancelled");
                    next = jobs.len();
                    self.pending_count.store(0, Ordering::SeqCst);
                    self.push_progress(&jobs);
                }

                if in_flight == 0 {
                    break;
                }

                let (index, attempts, result) = rx
                    .recv()
                    .expect("chapter task dropped its result channel");
                in_flight -= 1;
                let job = &mut jobs[index];
                job.attempts = attempts;
                job.completed_at = Some(Utc::now());
                match result {
                    Ok(text) => {
                        job.state = ChapterJobState::Completed;
                        job.content = Some(text.clone());
                        debug!(chapter = job.chapter_number, attempts, "chapter completed");
                        completed_texts.push(text);
                    }
                    Err(error) => {
                        job.state = ChapterJobState::Failed;
                        job.error = Some(truncate_error(&error));
                        warn!(chapter = job.chapter_number, attempts, error = %job.error.as_deref().unwrap_or(""), "chapter failed");
                    }
                }
                self.push_progress(&jobs);
            }
        });

        let progress = BatchProgress::from_jobs(&jobs, self.max_parallel);
        info!(
            completed = progress.completed,
            failed = progress.failed,
            cancelled = progress.cancelled,
            "chapter batch finished"
        );
        jobs
    }

    fn push_progress(&self, jobs: &[ChapterJob]) {
        let callback = self.progress_callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            cb(BatchProgress::from_jobs(jobs, self.max_parallel));
        }
    }
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    error.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillforge_recovery::GenerationError;
    use std::sync::atomic::AtomicU32;

    fn outlines(n: usize) -> Vec<ChapterOutline> {
        (1..=n)
            .map(|i| ChapterOutline::new(format!("Chapter {i}"), format!("Summary {i}")))
            .collect()
    }

    fn service(
        generator: impl Fn(&ChapterRequest) -> Result<String, GenerationError> + Send + Sync + 'static,
        max_parallel: usize,
    ) -> ParallelChapterService {
        ParallelChapterService::new(Arc::new(generator), max_parallel)
            .with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn generates_every_chapter() {
        let svc = service(|req| Ok(format!("text of {}", req.chapter_number)), 3);
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(7), "noir", "cast", 1);

        assert_eq!(jobs.len(), 7);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.state, ChapterJobState::Completed);
            assert_eq!(job.chapter_number, i as u32 + 1);
            assert_eq!(job.content.as_deref(), Some(format!("text of {}", i + 1).as_str()));
            assert_eq!(job.attempts, 1);
        }
    }

    #[test]
    fn concurrency_never_exceeds_the_cap() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (running2, peak2) = (running.clone(), peak.clone());

        let svc = service(
            move |_req| {
                let now = running2.fetch_add(1, Ordering::SeqCst) + 1;
                peak2.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running2.fetch_sub(1, Ordering::SeqCst);
                Ok("ch".to_string())
            },
            3,
        );
        svc.generate_chapters(ProjectId::new(), outlines(10), "", "", 1);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2, "cap should actually be used");
    }

    #[test]
    fn context_is_the_last_two_completed_chapters() {
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        // Sequential so completion order is deterministic.
        let svc = service(
            move |req| {
                seen2.lock().unwrap().push(req.previous_chapters.clone());
                Ok(format!("ch{}", req.chapter_number))
            },
            1,
        );
        svc.generate_chapters(ProjectId::new(), outlines(4), "", "", 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Vec::<String>::new());
        assert_eq!(seen[1], vec!["ch1"]);
        assert_eq!(seen[2], vec!["ch1", "ch2"]);
        // Window slides: chapter 1 drops out.
        assert_eq!(seen[3], vec!["ch2", "ch3"]);
    }

    #[test]
    fn transient_failures_retry_with_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let svc = service(
            move |_req| {
                if calls2.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GenerationError::new("upstream returned 503"))
                } else {
                    Ok("recovered".to_string())
                }
            },
            1,
        );
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(1), "", "", 1);
        assert_eq!(jobs[0].state, ChapterJobState::Completed);
        assert_eq!(jobs[0].attempts, 3);
    }

    #[test]
    fn exhausted_retries_fail_the_chapter_not_the_batch() {
        let svc = service(
            |req| {
                if req.chapter_number == 2 {
                    Err(GenerationError::new("model refused"))
                } else {
                    Ok(format!("ch{}", req.chapter_number))
                }
            },
            2,
        )
        .with_max_retries(1);
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(3), "", "", 1);

        assert_eq!(jobs[0].state, ChapterJobState::Completed);
        assert_eq!(jobs[1].state, ChapterJobState::Failed);
        assert_eq!(jobs[1].attempts, 2); // initial + 1 retry
        assert_eq!(jobs[1].error.as_deref(), Some("model refused"));
        assert_eq!(jobs[2].state, ChapterJobState::Completed);
    }

    #[test]
    fn panicking_generator_fails_the_chapter_not_the_batch() {
        let svc = service(
            |req| {
                if req.chapter_number == 2 {
                    panic!("generator bug");
                }
                Ok(format!("ch{}", req.chapter_number))
            },
            2,
        );
        // Must return rather than wait forever on the panicked slot.
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(3), "", "", 1);

        assert_eq!(jobs[0].state, ChapterJobState::Completed);
        assert_eq!(jobs[1].state, ChapterJobState::Failed);
        assert_eq!(jobs[1].error.as_deref(), Some("chapter generation panicked"));
        assert_eq!(jobs[2].state, ChapterJobState::Completed);
    }

    #[test]
    fn failed_chapter_errors_are_truncated() {
        let svc = service(
            |_req| Err(GenerationError::new("x".repeat(700))),
            1,
        )
        .with_max_retries(0);
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(1), "", "", 1);
        assert_eq!(jobs[0].error.as_ref().unwrap().chars().count(), 500);
    }

    #[test]
    fn cancel_flips_pending_chapters_and_reports_the_count() {
        let (started_tx, started_rx) = mpsc::channel::<u32>();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let resume_rx = Mutex::new(resume_rx);

        let svc = Arc::new(service(
            move |req| {
                started_tx.lock().unwrap().send(req.chapter_number).unwrap();
                resume_rx.lock().unwrap().recv().unwrap();
                Ok(format!("ch{}", req.chapter_number))
            },
            1,
        ));

        let svc2 = svc.clone();
        let batch = thread::spawn(move || {
            svc2.generate_chapters(ProjectId::new(), outlines(4), "", "", 1)
        });

        // Chapter 1 is generating; 3 remain pending.
        assert_eq!(started_rx.recv().unwrap(), 1);
        assert_eq!(svc.cancel(), 3);
        resume_tx.send(()).unwrap();

        let jobs = batch.join().unwrap();
        assert_eq!(jobs[0].state, ChapterJobState::Completed);
        for job in &jobs[1..] {
            assert_eq!(job.state, ChapterJobState::Cancelled);
        }
    }

    #[test]
    fn progress_callback_sees_every_state_change_and_ends_done() {
        let snapshots: Arc<Mutex<Vec<BatchProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let snapshots2 = snapshots.clone();

        let svc = service(|req| Ok(format!("ch{}", req.chapter_number)), 2);
        svc.set_progress_callback(move |p| snapshots2.lock().unwrap().push(p));
        svc.generate_chapters(ProjectId::new(), outlines(3), "", "", 1);

        let snapshots = snapshots.lock().unwrap();
        // One push per dispatch and one per completion.
        assert_eq!(snapshots.len(), 6);
        let last = snapshots.last().unwrap();
        assert!(last.is_done());
        assert_eq!(last.completed, 3);
        assert_eq!(last.progress, 1.0);
    }

    #[test]
    fn start_chapter_offsets_numbering() {
        let svc = service(|req| Ok(format!("ch{}", req.chapter_number)), 1);
        let jobs = svc.generate_chapters(ProjectId::new(), outlines(2), "", "", 10);
        assert_eq!(jobs[0].chapter_number, 10);
        assert_eq!(jobs[1].chapter_number, 11);
    }
}
