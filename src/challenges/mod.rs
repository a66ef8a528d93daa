//! Block detection and rendering-engine challenge fallback.

pub mod detectors;
pub mod engine;
pub mod pool;
pub mod tracker;

pub use detectors::{BlockDetection, BlockDetector};
pub use engine::{ChallengeSolution, EngineError, RenderSession, RenderingEngine};
pub use pool::{ChallengePool, ChallengeSolver, ChallengeWorker, PoolStats, SolveError};
pub use tracker::{ChallengeTracker, TrackerConfig, TrackerStats};
