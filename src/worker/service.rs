//! Job dispatch: receives descriptors from a queue, runs workers and
//! acknowledges their outcomes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{JobDescriptor, JobHandle, ScrapingWorker, WorkerContext};
use crate::store::JobProgress;

/// Source of job descriptors.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Next job, or `None` once the queue is closed.
    async fn next_job(&self) -> Option<JobDescriptor>;

    /// Report a job's terminal state back to the producer.
    async fn acknowledge(&self, outcome: &JobProgress);
}

/// In-process queue over tokio channels.
#[derive(Debug)]
pub struct ChannelQueue {
    jobs: tokio::sync::Mutex<mpsc::Receiver<JobDescriptor>>,
    acks: mpsc::UnboundedSender<JobProgress>,
}

impl ChannelQueue {
    /// Returns the queue, the producer side and the acknowledgement stream.
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Sender<JobDescriptor>,
        mpsc::UnboundedReceiver<JobProgress>,
    ) {
        let (job_tx, job_rx) = mpsc::channel(capacity.max(1));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: tokio::sync::Mutex::new(job_rx),
                acks: ack_tx,
            },
            job_tx,
            ack_rx,
        )
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn next_job(&self) -> Option<JobDescriptor> {
        self.jobs.lock().await.recv().await
    }

    async fn acknowledge(&self, outcome: &JobProgress) {
        if self.acks.send(outcome.clone()).is_err() {
            log::debug!("acknowledgement for job {} dropped, no listener", outcome.job_id);
        }
    }
}

struct LiveJob {
    progress: watch::Receiver<JobProgress>,
    cancel: CancellationToken,
}

/// Runs workers and keeps their progress pollable by job id.
#[derive(Clone)]
pub struct WorkerService {
    context: WorkerContext,
    live: Arc<Mutex<HashMap<String, LiveJob>>>,
    slots: Arc<Semaphore>,
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("running", &self.running())
            .field("free_slots", &self.slots.available_permits())
            .finish()
    }
}

impl WorkerService {
    pub fn new(context: WorkerContext, max_concurrent_jobs: usize) -> Self {
        Self {
            context,
            live: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveJob>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start one job immediately, outside the concurrency bound.
    pub fn start(&self, job: JobDescriptor) -> JobHandle {
        let handle = ScrapingWorker::new(job, self.context.clone()).spawn();
        self.live().insert(
            handle.job_id().to_string(),
            LiveJob {
                progress: handle.subscribe(),
                cancel: handle.cancellation_token(),
            },
        );
        handle
    }

    /// Latest progress for a running job.
    pub fn progress(&self, job_id: &str) -> Option<JobProgress> {
        self.live()
            .get(job_id)
            .map(|job| job.progress.borrow().clone())
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        match self.live().get(job_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Jobs not yet in a terminal state. Finished entries are pruned here.
    pub fn running(&self) -> usize {
        let mut live = self.live();
        live.retain(|_, job| !job.progress.borrow().status.is_terminal());
        live.len()
    }

    /// Pull jobs from `queue` until it closes or `shutdown` fires, running at
    /// most the configured number at once. Running jobs are cancelled on
    /// shutdown and awaited before returning.
    pub async fn run(&self, queue: Arc<dyn JobQueue>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = queue.next_job() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            log::info!("dispatching job {}", job.job_id);
            let handle = self.start(job);
            let service = self.clone();
            let queue = Arc::clone(&queue);
            let stop = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let job_id = handle.job_id().to_string();
                let cancel = handle.cancellation_token();
                let watcher = tokio::spawn(async move {
                    stop.cancelled().await;
                    cancel.cancel();
                });
                let outcome = handle.join().await;
                watcher.abort();
                service.live().remove(&job_id);
                queue.acknowledge(&outcome).await;
            });
        }

        if shutdown.is_cancelled() {
            for job in self.live().values() {
                job.cancel.cancel();
            }
        }
        while tasks.join_next().await.is_some() {}
        log::info!("worker service stopped");
    }
}
