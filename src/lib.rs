//! # quietfetch
//!
//! Paced, fingerprint-diverse retrieval of channel history from a platform
//! that actively looks for automated clients.
//!
//! The crate is organised leaf-first:
//!
//! - [`modules`]: profiles, rate buckets, circuit breaker, risk scoring,
//!   session state, header shaping, human pacing and transport events
//! - [`backends`]: the fingerprint-emulating HTTP backend seam and its
//!   reqwest implementation
//! - [`challenges`]: block-page detection, the Chrome-backed rendering engine,
//!   the bounded worker pool and the per-session attempt tracker
//! - [`transport`]: the session-bound request path tying the above together
//! - [`platform`], [`store`], [`export`], [`worker`]: the job side, from paging
//!   through messages to writing artifacts and sync state
//!
//! ## Example
//!
//! ```no_run
//! use quietfetch::{Harvester, JobDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let harvester = Harvester::from_env()?;
//!     let job = JobDescriptor::new("job-1", "1208476333089497189", "token.parts.here", "actor-1");
//!     let handle = harvester.service.start(job);
//!     let outcome = handle.join().await;
//!     println!("{} messages, status {}", outcome.messages_retrieved, outcome.status);
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod challenges;
pub mod config;
pub mod export;
pub mod modules;
pub mod platform;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod worker;

pub use crate::backends::{
    BackendError, BackendFactory, BackendKind, HttpBackend, ReqwestBackendFactory,
};
pub use crate::challenges::{ChallengePool, ChallengeSolver, ChallengeTracker, RenderingEngine};
pub use crate::config::{ConfigError, HarvestConfig};
pub use crate::export::{ExportError, ExportFormat};
pub use crate::modules::{CircuitBreaker, ProfileManager, RateLimiter, RiskMonitor};
pub use crate::platform::{Message, MessageSource, RestMessageSource};
pub use crate::runtime::{Harvester, SetupError};
pub use crate::store::{JobProgress, JobStatus, JobStore, RedbJobStore, SyncState};
pub use crate::transport::{
    TransportClient, TransportClientBuilder, TransportConfig, TransportError, TransportRegistry,
    TransportRequest, TransportResponse, TransportResult,
};
pub use crate::worker::{JobDescriptor, JobError, JobHandle, JobMode, ScrapingWorker, WorkerService};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
