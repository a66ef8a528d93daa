//! Progress estimation and publication.

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::WorkerContext;
use crate::store::{JobProgress, JobStatus};

/// Percent for `done` units. With a known total this is the real ratio held
/// below 100; otherwise a curve that flattens as the count grows, capped at 95.
pub fn estimate_percent(done: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => (done.saturating_mul(100) / total).min(99) as u8,
        _ if done < 100 => (20.0 + done as f64 * 0.5).min(70.0) as u8,
        _ => (70.0 + (done - 100) as f64 * 0.1).min(95.0) as u8,
    }
}

/// Owns a job's [`JobProgress`] and mirrors every change into a watch channel.
#[derive(Debug)]
pub struct ProgressReporter {
    progress: JobProgress,
    total: Option<u64>,
    tx: watch::Sender<JobProgress>,
}

impl ProgressReporter {
    pub fn new(progress: JobProgress, total: Option<u64>) -> (Self, watch::Receiver<JobProgress>) {
        let (tx, rx) = watch::channel(progress.clone());
        (Self { progress, total, tx }, rx)
    }

    pub fn current(&self) -> &JobProgress {
        &self.progress
    }

    pub fn start(&mut self) {
        self.progress.status = JobStatus::Running;
        self.progress.started_at = Some(Utc::now());
        self.publish();
    }

    /// Record the running count. The percent never moves backwards.
    pub fn advance(&mut self, done: u64) {
        self.progress.messages_retrieved = done;
        let estimate = estimate_percent(done, self.total);
        self.progress.progress_percent = self.progress.progress_percent.max(estimate);
        self.publish();
    }

    /// Settle into a terminal status. Only the first call has an effect.
    pub fn finish(
        &mut self,
        status: JobStatus,
        error: Option<String>,
        artifact: Option<String>,
    ) -> bool {
        if self.progress.status.is_terminal() {
            return false;
        }
        self.progress.status = status;
        self.progress.error_message = error;
        self.progress.artifact_path = artifact;
        self.progress.completed_at = Some(Utc::now());
        if status == JobStatus::Completed {
            self.progress.progress_percent = 100;
        }
        self.publish();
        true
    }

    fn publish(&self) {
        self.tx.send_replace(self.progress.clone());
    }
}

/// Caller-side view of a spawned job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    progress: watch::Receiver<JobProgress>,
    cancel: CancellationToken,
    task: JoinHandle<JobProgress>,
    context: WorkerContext,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: String,
        progress: watch::Receiver<JobProgress>,
        cancel: CancellationToken,
        task: JoinHandle<JobProgress>,
        context: WorkerContext,
    ) -> Self {
        Self {
            job_id,
            progress,
            cancel,
            task,
            context,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Latest snapshot; safe to poll at any time.
    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the terminal snapshot. If the task died without settling,
    /// the job is recorded as failed and its session released here.
    pub async fn join(self) -> JobProgress {
        match self.task.await {
            Ok(progress) => progress,
            Err(err) => {
                log::error!("job {} task ended abnormally: {err}", self.job_id);
                let mut progress = self.progress.borrow().clone();
                if !progress.status.is_terminal() {
                    progress.status = JobStatus::Failed;
                    progress.error_message = Some(format!("worker task aborted: {err}"));
                    progress.completed_at = Some(Utc::now());
                }
                if let Err(save_err) = self.context.store.save_progress(&progress).await {
                    log::error!("job {}: could not persist abnormal exit: {save_err}", self.job_id);
                }
                self.context.sources.release(&self.job_id);
                progress
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_total_caps_at_99() {
        assert_eq!(estimate_percent(50, Some(200)), 25);
        assert_eq!(estimate_percent(200, Some(200)), 99);
        assert_eq!(estimate_percent(500, Some(200)), 99);
    }

    #[test]
    fn unknown_total_curve() {
        assert_eq!(estimate_percent(0, None), 20);
        assert_eq!(estimate_percent(40, None), 40);
        assert_eq!(estimate_percent(99, None), 69);
        assert_eq!(estimate_percent(100, None), 70);
        assert_eq!(estimate_percent(200, None), 80);
        assert_eq!(estimate_percent(10_000, None), 95);
    }

    #[test]
    fn percent_never_decreases_and_finish_is_once() {
        let (mut reporter, rx) = ProgressReporter::new(JobProgress::new("j", "t"), None);
        reporter.start();
        reporter.advance(150);
        assert_eq!(rx.borrow().progress_percent, 75);
        reporter.advance(10);
        assert_eq!(rx.borrow().progress_percent, 75);

        assert!(reporter.finish(JobStatus::Cancelled, None, None));
        assert!(!reporter.finish(JobStatus::Completed, None, None));
        assert_eq!(rx.borrow().status, JobStatus::Cancelled);
    }
}
