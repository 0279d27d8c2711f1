//! Progress-callback trait for per-job extraction events.
//!
//! Pass a [`RunProgressCallback`] to [`crate::realtime::run_realtime`] to
//! receive real-time events as the engine works through its claimed jobs.
//! Callers can forward events to a terminal progress bar, a WebSocket, or a
//! log sink without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because jobs are processed
//! concurrently.

/// Called by the realtime engine as it processes each claimed job.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `on_job_done` and `on_job_failed` may be called
/// concurrently from different workers; implementations must protect shared
/// mutable state.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after claiming, before any job is processed.
    fn on_run_start(&self, total_jobs: usize) {
        let _ = total_jobs;
    }

    /// Called just before a job's request is built and sent.
    fn on_job_start(&self, folder: &str, page_num: u32) {
        let _ = (folder, page_num);
    }

    /// Called when a job's extraction completes and is recorded.
    fn on_job_done(&self, folder: &str, page_num: u32) {
        let _ = (folder, page_num);
    }

    /// Called when a job fails terminally (build failure or non-transient
    /// API error).
    fn on_job_failed(&self, folder: &str, page_num: u32, error: &str) {
        let _ = (folder, page_num, error);
    }

    /// Called once after every claimed job has been attempted.
    fn on_run_complete(&self, total_jobs: usize, completed: usize) {
        let _ = (total_jobs, completed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        starts: AtomicUsize,
        done: AtomicUsize,
        failed: AtomicUsize,
    }

    impl RunProgressCallback for TrackingCallback {
        fn on_job_start(&self, _folder: &str, _page_num: u32) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_done(&self, _folder: &str, _page_num: u32) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_failed(&self, _folder: &str, _page_num: u32, _error: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5);
        cb.on_job_start("alqab", 1);
        cb.on_job_done("alqab", 1);
        cb.on_job_failed("alqab", 2, "some error");
        cb.on_run_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            starts: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        };

        tracker.on_job_start("alqab", 1);
        tracker.on_job_done("alqab", 1);
        tracker.on_job_start("alqab", 2);
        tracker.on_job_failed("alqab", 2, "VLM timeout");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.done.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failed.load(Ordering::SeqCst), 1);
    }
}
