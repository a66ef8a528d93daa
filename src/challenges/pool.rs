//! Capacity-bounded pool of rendering-engine workers.
//!
//! Slots are tokio semaphore permits, so waiters are served strictly in
//! arrival order and never more than `max_concurrent` workers exist. A worker
//! owns its permit: releasing it, dropping it or cancelling the task holding
//! it all return the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use super::engine::{
    ChallengeSolution, EngineError, RenderSession, RenderingEngine, SolveConfig, solve_in_session,
};
use super::tracker::ChallengeTracker;
use crate::backends::BackendKind;
use crate::modules::rate_limit::RateLimiter;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub active_workers: usize,
    pub available_slots: usize,
}

/// Shared pool; clones hand out slots from the same semaphore.
#[derive(Clone)]
pub struct ChallengePool {
    engine: Arc<dyn RenderingEngine>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    active: Arc<AtomicUsize>,
    solve_config: SolveConfig,
}

impl std::fmt::Debug for ChallengePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengePool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ChallengePool {
    pub fn new(engine: Arc<dyn RenderingEngine>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            engine,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            active: Arc::new(AtomicUsize::new(0)),
            solve_config: SolveConfig::default(),
        }
    }

    pub fn with_solve_config(mut self, config: SolveConfig) -> Self {
        self.solve_config = config;
        self
    }

    /// Wait for a slot and provision a worker in it. `None` when the engine
    /// could not be launched; the slot is returned in that case.
    pub async fn acquire(&self) -> Option<ChallengeWorker> {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                log::error!("challenge pool is shut down");
                return None;
            }
        };

        match self.engine.launch().await {
            Ok(session) => {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                log::debug!("challenge worker provisioned ({active}/{})", self.max_concurrent);
                Some(ChallengeWorker {
                    session: Some(session),
                    active: Arc::clone(&self.active),
                    solve_config: self.solve_config.clone(),
                    _permit: permit,
                })
            }
            Err(err) => {
                log::error!("failed to provision challenge worker: {err}");
                None
            }
        }
    }

    /// Close the worker's engine session and free its slot.
    pub async fn release(&self, mut worker: ChallengeWorker) {
        worker.close().await;
    }

    /// Refuse new acquisitions; current holders keep their workers.
    pub fn shutdown(&self) {
        self.slots.close();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.max_concurrent,
            active_workers: self.active.load(Ordering::SeqCst),
            available_slots: self.slots.available_permits(),
        }
    }
}

/// One provisioned engine session holding a pool slot.
pub struct ChallengeWorker {
    session: Option<Box<dyn RenderSession>>,
    active: Arc<AtomicUsize>,
    solve_config: SolveConfig,
    _permit: OwnedSemaphorePermit,
}

impl ChallengeWorker {
    pub async fn solve(
        &mut self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<ChallengeSolution, EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::Closed)?;
        solve_in_session(session.as_mut(), url, headers, &self.solve_config).await
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take()
            && let Err(err) = session.close().await
        {
            log::debug!("engine session close failed: {err}");
        }
    }
}

impl Drop for ChallengeWorker {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("challenge attempts exhausted for session {0}")]
    Denied(String),
    #[error("no challenge worker could be provisioned")]
    Unavailable,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Tracker gate + rendering rate bucket + pool, as one call.
#[derive(Debug, Clone)]
pub struct ChallengeSolver {
    tracker: ChallengeTracker,
    pool: ChallengePool,
    limiter: RateLimiter,
}

impl ChallengeSolver {
    pub fn new(tracker: ChallengeTracker, pool: ChallengePool, limiter: RateLimiter) -> Self {
        Self { tracker, pool, limiter }
    }

    pub fn tracker(&self) -> &ChallengeTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &ChallengePool {
        &self.pool
    }

    pub async fn solve(
        &self,
        session_id: &str,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<ChallengeSolution, SolveError> {
        if !self.tracker.may_attempt(session_id) {
            return Err(SolveError::Denied(session_id.to_string()));
        }

        self.limiter.acquire(BackendKind::Rendering).await;

        let Some(mut worker) = self.pool.acquire().await else {
            self.tracker.record(session_id, false);
            return Err(SolveError::Unavailable);
        };

        let outcome = worker.solve(url, headers).await;
        self.pool.release(worker).await;
        self.tracker.record(session_id, outcome.is_ok());

        match &outcome {
            Ok(solution) => log::info!(
                "challenge solved for session {session_id} ({:?}, {} cookies)",
                solution.completed_by,
                solution.cookies.len()
            ),
            Err(err) => log::error!("challenge solve failed for session {session_id}: {err}"),
        }
        outcome.map_err(SolveError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::engine::{EngineCookie, EngineResult, PageProbe};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct InstantSession;

    #[async_trait]
    impl RenderSession for InstantSession {
        async fn set_user_agent(&mut self, _: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn set_extra_headers(&mut self, _: &[(String, String)]) -> EngineResult<()> {
            Ok(())
        }
        async fn navigate(&mut self, _: &Url) -> EngineResult<()> {
            Ok(())
        }
        async fn probe(&mut self) -> EngineResult<PageProbe> {
            Ok(PageProbe {
                url: "https://example.com/".into(),
                ready_state: "complete".into(),
                loaded_marker: true,
                challenge_present: false,
            })
        }
        async fn cookies(&mut self, _: &Url) -> EngineResult<Vec<EngineCookie>> {
            Ok(vec![EngineCookie {
                name: "cf_clearance".into(),
                value: "ok".into(),
                domain: "example.com".into(),
            }])
        }
        async fn user_agent(&mut self) -> EngineResult<String> {
            Ok("Engine/1.0".into())
        }
        async fn storage(&mut self) -> EngineResult<(HashMap<String, String>, HashMap<String, String>)> {
            Ok((HashMap::new(), HashMap::new()))
        }
        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
    }

    struct Engine {
        fail: bool,
    }

    #[async_trait]
    impl RenderingEngine for Engine {
        async fn launch(&self) -> EngineResult<Box<dyn RenderSession>> {
            if self.fail {
                Err(EngineError::Launch("no chrome".into()))
            } else {
                Ok(Box::new(InstantSession))
            }
        }
    }

    #[tokio::test]
    async fn failed_provisioning_returns_slot() {
        let pool = ChallengePool::new(Arc::new(Engine { fail: true }), 1);
        assert!(pool.acquire().await.is_none());
        assert_eq!(pool.stats().available_slots, 1);
        assert_eq!(pool.stats().active_workers, 0);
    }

    #[tokio::test]
    async fn dropping_worker_frees_slot() {
        let pool = ChallengePool::new(Arc::new(Engine { fail: false }), 1);
        let worker = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().available_slots, 0);
        assert_eq!(pool.stats().active_workers, 1);
        drop(worker);
        assert_eq!(pool.stats().available_slots, 1);
        assert_eq!(pool.stats().active_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn solver_records_outcomes_and_gates() {
        let pool = ChallengePool::new(Arc::new(Engine { fail: false }), 2);
        let solver = ChallengeSolver::new(ChallengeTracker::default(), pool, RateLimiter::default());
        let url = Url::parse("https://example.com/").unwrap();

        for _ in 0..3 {
            let solution = solver.solve("s", &url, &[]).await.unwrap();
            assert_eq!(solution.cookie_header().as_deref(), Some("cf_clearance=ok"));
        }
        assert!(matches!(
            solver.solve("s", &url, &[]).await,
            Err(SolveError::Denied(_))
        ));
        assert_eq!(solver.tracker().stats().successful_solves, 3);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!(solver.solve("s", &url, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_engine_counts_as_failure() {
        let pool = ChallengePool::new(Arc::new(Engine { fail: true }), 1);
        let solver = ChallengeSolver::new(ChallengeTracker::default(), pool, RateLimiter::default());
        let url = Url::parse("https://example.com/").unwrap();
        assert!(matches!(solver.solve("s", &url, &[]).await, Err(SolveError::Unavailable)));
        assert_eq!(solver.tracker().record_for("s").unwrap().consecutive_failures, 1);
    }
}
