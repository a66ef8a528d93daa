//! Process-level assembly of the shared components.
//!
//! One [`Harvester`] holds the state that outlives individual jobs (profile
//! cache, rate buckets, challenge pool and tracker, circuit breaker, risk
//! windows, transport registry and the job store) and hands out a
//! [`WorkerService`] built on them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::challenges::engine::{ChromeEngine, RenderingEngine};
use crate::challenges::pool::{ChallengePool, ChallengeSolver};
use crate::challenges::tracker::ChallengeTracker;
use crate::config::HarvestConfig;
use crate::modules::circuit::CircuitBreaker;
use crate::modules::profiles::ProfileManager;
use crate::modules::rate_limit::RateLimiter;
use crate::modules::risk::RiskMonitor;
use crate::platform::RestSourceFactory;
use crate::store::{JobStore, PersistenceError, RedbJobStore};
use crate::transport::{TransportClient, TransportRegistry};
use crate::worker::{WorkerContext, WorkerService};

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone)]
pub struct Harvester {
    pub profiles: ProfileManager,
    pub limiter: RateLimiter,
    pub circuit: CircuitBreaker,
    pub risk: RiskMonitor,
    pub pool: ChallengePool,
    pub tracker: ChallengeTracker,
    pub registry: TransportRegistry,
    pub service: WorkerService,
}

impl Harvester {
    /// Read `QUIETFETCH_*` variables and assemble with Chrome and redb.
    pub fn from_env() -> Result<Self, SetupError> {
        let config = HarvestConfig::from_env()?;
        let store = Arc::new(RedbJobStore::open(&config.database_path)?);
        let engine = Arc::new(ChromeEngine::new(config.chrome()));
        Ok(Self::assemble(&config, store, engine, TransportClient::builder()))
    }

    /// Assemble around caller-supplied store, engine and transport template.
    pub fn assemble(
        config: &HarvestConfig,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn RenderingEngine>,
        template: crate::transport::TransportClientBuilder,
    ) -> Self {
        let profiles = ProfileManager::default();
        let limiter = RateLimiter::default();
        let circuit = CircuitBreaker::new(config.circuit());
        let risk = RiskMonitor::default();
        let tracker = ChallengeTracker::new(config.tracker());
        let pool = ChallengePool::new(engine, config.max_concurrent_browsers)
            .with_solve_config(config.solve());
        let solver = ChallengeSolver::new(tracker.clone(), pool.clone(), limiter.clone());

        let template = template
            .with_config(config.transport())
            .with_profiles(profiles.clone())
            .with_rate_limiter(limiter.clone())
            .with_circuit_breaker(circuit.clone())
            .with_challenge_solver(solver);
        let registry = TransportRegistry::new(template);

        let sources = Arc::new(RestSourceFactory::new(registry.clone(), config.api_base.clone()));
        let context = WorkerContext {
            store,
            risk: risk.clone(),
            sources,
            config: config.worker(),
        };
        let service = WorkerService::new(context, config.max_concurrent_jobs);

        Self {
            profiles,
            limiter,
            circuit,
            risk,
            pool,
            tracker,
            registry,
            service,
        }
    }

    /// Periodic eviction of stale sessions and profile assignments.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sweeper = self.registry.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone());
        let profiles = self.profiles.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = profiles.sweep();
                        if evicted > 0 {
                            log::debug!("evicted {evicted} profile assignments");
                        }
                    }
                }
            }
            let _ = sweeper.await;
        })
    }

    /// Stop handing out challenge workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
