//! Per-job retrieval loop.
//!
//! A [`ScrapingWorker`] takes one [`JobDescriptor`] from pending to a terminal
//! status. It pages through the target oldest-first, paces itself like a
//! person reading, consults the risk monitor before every fetch and persists
//! progress as it goes. Whatever the exit path (completion, failure or
//! cancellation) the progress record is finalised exactly once and the
//! transport session is closed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::export::{self, ExportError, ExportFormat};
use crate::modules::pacing::{HumanPacer, PacingConfig, uniform_delay};
use crate::modules::risk::{Activity, RiskMonitor};
use crate::platform::{
    MAX_PAGE_SIZE, Message, MessageSource, MessageSourceFactory, PageQuery, id_at, is_valid_id,
};
use crate::store::{JobProgress, JobStatus, JobStore, PersistenceError, SyncState};
use crate::transport::TransportError;

pub mod progress;
pub mod service;

pub use progress::{JobHandle, ProgressReporter, estimate_percent};
pub use service::{ChannelQueue, JobQueue, WorkerService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Full,
    Incremental,
    DateRange,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub target_id: String,
    pub credential: String,
    pub actor_id: String,
    pub mode: JobMode,
    pub format: ExportFormat,
    #[serde(default)]
    pub date_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("job_id", &self.job_id)
            .field("target_id", &self.target_id)
            .field("credential", &"***")
            .field("actor_id", &self.actor_id)
            .field("mode", &self.mode)
            .field("format", &self.format)
            .field("date_after", &self.date_after)
            .field("date_before", &self.date_before)
            .field("limit", &self.limit)
            .finish()
    }
}

impl JobDescriptor {
    pub fn new(
        job_id: impl Into<String>,
        target_id: impl Into<String>,
        credential: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            target_id: target_id.into(),
            credential: credential.into(),
            actor_id: actor_id.into(),
            mode: JobMode::Full,
            format: ExportFormat::Json,
            date_after: None,
            date_before: None,
            limit: None,
        }
    }

    /// Reject malformed ids and credentials before any network traffic.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_id.trim().is_empty() {
            return Err(JobError::Validation("job id is empty".into()));
        }
        if self.actor_id.trim().is_empty() {
            return Err(JobError::Validation("actor id is empty".into()));
        }
        if !is_valid_id(&self.target_id) {
            return Err(JobError::Validation(format!(
                "target id '{}' is not a numeric id",
                self.target_id
            )));
        }
        if !is_valid_credential(&self.credential) {
            return Err(JobError::Validation("credential is not a well-formed token".into()));
        }
        if self.limit == Some(0) {
            return Err(JobError::Validation("item limit must be positive".into()));
        }
        if self.mode == JobMode::DateRange {
            match (self.date_after, self.date_before) {
                (None, None) => {
                    return Err(JobError::Validation("date range job without bounds".into()));
                }
                (Some(after), Some(before)) if after >= before => {
                    return Err(JobError::Validation("date range is empty".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Two or three non-empty dot-separated segments, no whitespace.
fn is_valid_credential(credential: &str) -> bool {
    let segments: Vec<&str> = credential.split('.').collect();
    (2..=3).contains(&segments.len())
        && segments
            .iter()
            .all(|segment| !segment.is_empty() && !segment.chars().any(char::is_whitespace))
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("job cancelled")]
    Cancelled,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub page_size: u8,
    /// Persist progress every this many units.
    pub progress_every: u64,
    pub exports_dir: PathBuf,
    pub pacing: PacingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            progress_every: 10,
            exports_dir: PathBuf::from("exports"),
            pacing: PacingConfig::default(),
        }
    }
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub risk: RiskMonitor,
    pub sources: Arc<dyn MessageSourceFactory>,
    pub config: WorkerConfig,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .finish()
    }
}

pub struct ScrapingWorker {
    job: JobDescriptor,
    context: WorkerContext,
    reporter: ProgressReporter,
    receiver: watch::Receiver<JobProgress>,
    pacer: HumanPacer,
    messages: Vec<Message>,
    sync: Option<SyncState>,
}

impl ScrapingWorker {
    pub fn new(job: JobDescriptor, context: WorkerContext) -> Self {
        let (reporter, receiver) =
            ProgressReporter::new(JobProgress::new(&job.job_id, &job.target_id), job.limit);
        let pacer = HumanPacer::new(context.config.pacing.clone());
        Self {
            job,
            context,
            reporter,
            receiver,
            pacer,
            messages: Vec::new(),
            sync: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.receiver.clone()
    }

    /// Run on a new task and return a handle for polling and cancellation.
    pub fn spawn(self) -> JobHandle {
        let cancel = CancellationToken::new();
        let job_id = self.job.job_id.clone();
        let receiver = self.subscribe();
        let context = self.context.clone();
        let task = tokio::spawn(self.run(cancel.clone()));
        JobHandle::new(job_id, receiver, cancel, task, context)
    }

    /// Drive the job to a terminal status and return the final snapshot.
    pub async fn run(mut self, cancel: CancellationToken) -> JobProgress {
        log::info!(
            "job {} starting ({:?} on {})",
            self.job.job_id,
            self.job.mode,
            self.job.target_id
        );
        self.reporter.start();
        if let Err(err) = self.save_progress().await {
            log::error!("job {}: could not persist start: {err}", self.job.job_id);
        }

        let outcome = match self.open_source() {
            Ok(source) => {
                self.context.risk.start_session(&self.job.actor_id);
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(JobError::Cancelled),
                    result = AssertUnwindSafe(self.retrieve(source.as_ref())).catch_unwind() => {
                        result.unwrap_or_else(|payload| {
                            Err(JobError::Panicked(panic_message(payload)))
                        })
                    }
                };
                source.close().await;
                self.context.risk.end_session(&self.job.actor_id);
                outcome
            }
            Err(err) => Err(err),
        };

        self.finalize(outcome).await;
        self.reporter.current().clone()
    }

    fn open_source(&self) -> Result<Arc<dyn MessageSource>, JobError> {
        self.job.validate()?;
        Ok(self.context.sources.open(&self.job.job_id, &self.job.credential)?)
    }

    fn remaining(&self) -> Option<u64> {
        self.job
            .limit
            .map(|limit| limit.saturating_sub(self.messages.len() as u64))
    }

    async fn starting_cursor(&mut self) -> Result<Option<String>, JobError> {
        match self.job.mode {
            JobMode::Full => Ok(None),
            JobMode::DateRange => Ok(self.job.date_after.map(id_at)),
            JobMode::Incremental => {
                let state = self.context.store.load_sync_state(&self.job.target_id).await?;
                let cursor = state.as_ref().and_then(|state| state.last_message_id.clone());
                if let Some(id) = &cursor
                    && !is_valid_id(id)
                {
                    return Err(JobError::Validation(format!("stored cursor '{id}' is malformed")));
                }
                self.sync = state;
                Ok(cursor)
            }
        }
    }

    async fn retrieve(&mut self, source: &dyn MessageSource) -> Result<(), JobError> {
        let actor = self.job.actor_id.clone();
        let mut cursor = self.starting_cursor().await?;
        self.context.risk.log_activity(
            &actor,
            Activity::ChannelAccessed {
                channel_id: self.job.target_id.clone(),
            },
        );

        let mut circuit_paused = false;
        loop {
            let remaining = self.remaining();
            if remaining == Some(0) {
                break;
            }

            self.pause_if_risky().await;

            let limit = remaining
                .map_or(self.context.config.page_size as u64, |left| {
                    left.min(self.context.config.page_size as u64)
                })
                .max(1) as u8;
            let query = PageQuery {
                channel_id: self.job.target_id.clone(),
                after: cursor.clone(),
                limit,
            };

            let page = match source.fetch_page(&query).await {
                Ok(page) => {
                    circuit_paused = false;
                    page
                }
                Err(TransportError::CircuitOpen { retry_in }) if !circuit_paused => {
                    circuit_paused = true;
                    let pause = uniform_delay(self.context.risk.recommended_delay(&actor));
                    let delay = retry_in.max(pause);
                    log::warn!(
                        "job {}: remote unavailable (circuit open), pausing {:?}",
                        self.job.job_id,
                        delay
                    );
                    sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    self.context.risk.log_activity(
                        &actor,
                        Activity::Error {
                            reason: err.to_string(),
                        },
                    );
                    return Err(err.into());
                }
            };

            if page.is_empty() {
                break;
            }
            let full_page = page.len() >= limit as usize;

            let mut reached_end = false;
            for message in page {
                if !is_valid_id(&message.id) {
                    return Err(JobError::Validation(format!(
                        "remote returned malformed id '{}'",
                        message.id
                    )));
                }
                if let Some(before) = self.job.date_before
                    && message.timestamp >= before
                {
                    reached_end = true;
                    break;
                }
                cursor = Some(message.id.clone());
                if let Some(after) = self.job.date_after
                    && message.timestamp < after
                {
                    continue;
                }

                self.messages.push(message);
                self.context.risk.log_activity(&actor, Activity::MessageFetched);
                self.pace().await;

                let done = self.messages.len() as u64;
                if done % self.context.config.progress_every.max(1) == 0 {
                    log::info!("job {}: {done} messages retrieved", self.job.job_id);
                    self.reporter.advance(done);
                    self.save_progress().await?;
                }
                if self.remaining() == Some(0) {
                    reached_end = true;
                    break;
                }
            }

            if reached_end || !full_page {
                break;
            }
        }
        Ok(())
    }

    async fn pause_if_risky(&self) {
        let actor = &self.job.actor_id;
        if !self.context.risk.should_pause(actor) {
            return;
        }
        let delay = uniform_delay(self.context.risk.recommended_delay(actor));
        log::warn!(
            "job {}: risk {:.2} above threshold, pausing {:?}",
            self.job.job_id,
            self.context.risk.calculate_risk(actor),
            delay
        );
        sleep(delay).await;
    }

    async fn pace(&mut self) {
        let mut delay = self.pacer.unit_delay();
        if let Some(pause) = self.pacer.reading_pause() {
            log::debug!("job {}: reading pause {:?}", self.job.job_id, pause);
            delay += pause;
        }
        if let Some(burst) = self.pacer.register_unit() {
            log::debug!("job {}: burst delay {:?}", self.job.job_id, burst);
            delay += burst;
        }
        if let Some(wait) = self.pacer.hourly_wait() {
            log::info!("job {}: hourly message cap reached, waiting {:?}", self.job.job_id, wait);
            delay += wait;
        }
        sleep(delay).await;
    }

    async fn save_progress(&self) -> Result<(), PersistenceError> {
        self.context.store.save_progress(self.reporter.current()).await
    }

    /// Write the artifact and move the sync cursor to the newest processed unit.
    async fn write_outputs(&mut self) -> Result<String, JobError> {
        let path = export::write_artifact(
            &self.context.config.exports_dir,
            &self.job.target_id,
            self.job.format,
            &self.messages,
        )
        .await?;

        if let Some(last) = self.messages.last() {
            let mut state = self
                .sync
                .take()
                .unwrap_or_else(|| SyncState::new(&self.job.target_id));
            state.advance(&last.id, Some(last.timestamp), self.messages.len() as u64);
            self.context.store.save_sync_state(&state).await?;
            self.sync = Some(state);
        }
        Ok(path.display().to_string())
    }

    async fn finalize(&mut self, outcome: Result<(), JobError>) {
        let done = self.messages.len() as u64;
        if done > self.reporter.current().messages_retrieved {
            self.reporter.advance(done);
        }

        match outcome {
            Ok(()) => match self.write_outputs().await {
                Ok(path) => {
                    log::info!("job {} completed with {done} messages", self.job.job_id);
                    self.reporter.finish(JobStatus::Completed, None, Some(path));
                }
                Err(err) => {
                    log::error!("job {} failed while writing outputs: {err}", self.job.job_id);
                    self.reporter.finish(JobStatus::Failed, Some(err.to_string()), None);
                }
            },
            Err(JobError::Cancelled) => {
                log::info!("job {} cancelled after {done} messages", self.job.job_id);
                self.reporter
                    .finish(JobStatus::Cancelled, Some("job cancelled".into()), None);
            }
            Err(err) => {
                log::error!("job {} failed: {err}", self.job.job_id);
                let keep_partial =
                    self.job.mode == JobMode::Incremental && !self.messages.is_empty();
                let artifact = if keep_partial {
                    match self.write_outputs().await {
                        Ok(path) => Some(path),
                        Err(write_err) => {
                            log::error!(
                                "job {}: partial artifact not written: {write_err}",
                                self.job.job_id
                            );
                            None
                        }
                    }
                } else {
                    None
                };
                self.reporter.finish(JobStatus::Failed, Some(err.to_string()), artifact);
            }
        }

        if let Err(err) = self.save_progress().await {
            log::error!("job {}: could not persist final state: {err}", self.job.job_id);
        }
    }
}
