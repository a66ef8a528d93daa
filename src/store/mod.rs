//! Job progress and incremental sync-state persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod redb_store;

pub use redb_store::RedbJobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub target_id: String,
    pub status: JobStatus,
    pub messages_retrieved: u64,
    pub progress_percent: u8,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact_path: Option<String>,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            target_id: target_id.into(),
            status: JobStatus::Pending,
            messages_retrieved: 0,
            progress_percent: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            artifact_path: None,
        }
    }
}

/// Where the last run against a target stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub target_id: String,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            ..Self::default()
        }
    }

    /// Move the cursor to the newest processed unit and add `count` to the total.
    pub fn advance(&mut self, last_id: &str, last_at: Option<DateTime<Utc>>, count: u64) {
        self.last_message_id = Some(last_id.to_string());
        if last_at.is_some() {
            self.last_message_at = last_at;
        }
        self.total_messages += count;
        self.last_sync_at = Some(Utc::now());
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("row encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_progress(&self, job_id: &str) -> PersistenceResult<Option<JobProgress>>;

    async fn save_progress(&self, progress: &JobProgress) -> PersistenceResult<()>;

    async fn load_sync_state(&self, target_id: &str) -> PersistenceResult<Option<SyncState>>;

    async fn save_sync_state(&self, state: &SyncState) -> PersistenceResult<()>;
}
