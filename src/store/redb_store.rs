//! redb-backed [`JobStore`]. Rows are JSON documents keyed by id.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::{Database, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{JobProgress, JobStore, PersistenceError, PersistenceResult, SyncState};

type Rows = TableDefinition<'static, &'static str, &'static [u8]>;

const PROGRESS_TABLE: Rows = TableDefinition::new("job_progress");
const SYNC_TABLE: Rows = TableDefinition::new("sync_state");

fn db_error(err: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Database(err.to_string())
}

#[derive(Debug, Clone)]
pub struct RedbJobStore {
    db: Arc<Database>,
}

impl RedbJobStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let db = Database::create(path.as_ref()).map_err(db_error)?;
        Self::initialise(db)
    }

    /// Non-persistent store, used for tests and dry runs.
    pub fn in_memory() -> PersistenceResult<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(db_error)?;
        Self::initialise(db)
    }

    fn initialise(db: Database) -> PersistenceResult<Self> {
        let txn = db.begin_write().map_err(db_error)?;
        {
            txn.open_table(PROGRESS_TABLE).map_err(db_error)?;
            txn.open_table(SYNC_TABLE).map_err(db_error)?;
        }
        txn.commit().map_err(db_error)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn put<T: Serialize>(&self, table: Rows, key: &str, row: &T) -> PersistenceResult<()> {
        let encoded = serde_json::to_vec(row)?;
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || write_row(&db, table, &key, &encoded))
            .await
            .map_err(|err| PersistenceError::Task(err.to_string()))?
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: Rows,
        key: &str,
    ) -> PersistenceResult<Option<T>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        let raw = tokio::task::spawn_blocking(move || read_row(&db, table, &key))
            .await
            .map_err(|err| PersistenceError::Task(err.to_string()))??;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn write_row(db: &Database, table: Rows, key: &str, value: &[u8]) -> PersistenceResult<()> {
    let txn = db.begin_write().map_err(db_error)?;
    {
        let mut rows = txn.open_table(table).map_err(db_error)?;
        rows.insert(key, value).map_err(db_error)?;
    }
    txn.commit().map_err(db_error)
}

fn read_row(db: &Database, table: Rows, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
    let txn = db.begin_read().map_err(db_error)?;
    let rows = txn.open_table(table).map_err(db_error)?;
    let row = rows.get(key).map_err(db_error)?;
    Ok(row.map(|guard| guard.value().to_vec()))
}

#[async_trait]
impl JobStore for RedbJobStore {
    async fn load_progress(&self, job_id: &str) -> PersistenceResult<Option<JobProgress>> {
        self.fetch(PROGRESS_TABLE, job_id).await
    }

    async fn save_progress(&self, progress: &JobProgress) -> PersistenceResult<()> {
        self.put(PROGRESS_TABLE, &progress.job_id, progress).await
    }

    async fn load_sync_state(&self, target_id: &str) -> PersistenceResult<Option<SyncState>> {
        self.fetch(SYNC_TABLE, target_id).await
    }

    async fn save_sync_state(&self, state: &SyncState) -> PersistenceResult<()> {
        self.put(SYNC_TABLE, &state.target_id, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStatus;

    #[tokio::test]
    async fn progress_round_trips() {
        let store = RedbJobStore::in_memory().unwrap();
        assert!(store.load_progress("job-1").await.unwrap().is_none());

        let mut progress = JobProgress::new("job-1", "123");
        progress.status = JobStatus::Running;
        progress.messages_retrieved = 40;
        progress.progress_percent = 37;
        store.save_progress(&progress).await.unwrap();

        let loaded = store.load_progress("job-1").await.unwrap().unwrap();
        assert_eq!(loaded, progress);
    }

    #[tokio::test]
    async fn sync_state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("quietfetch-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("jobs.redb");

        let mut state = SyncState::new("555");
        state.advance("999", None, 12);
        {
            let store = RedbJobStore::open(&path).unwrap();
            store.save_sync_state(&state).await.unwrap();
        }

        let reopened = RedbJobStore::open(&path).unwrap();
        let loaded = reopened.load_sync_state("555").await.unwrap().unwrap();
        assert_eq!(loaded.last_message_id.as_deref(), Some("999"));
        assert_eq!(loaded.total_messages, 12);
        std::fs::remove_dir_all(&dir).ok();
    }
}
