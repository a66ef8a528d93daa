//! Cross-cutting services used by the transport and the worker.
//!
//! Every type here is a constructor-injected state object; clones share state.

pub mod circuit;
pub mod events;
pub mod headers;
pub mod pacing;
pub mod profiles;
pub mod rate_limit;
pub mod risk;
pub mod session;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitPhase, CircuitState};
pub use events::{
    ChallengeEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler, PostResponseEvent,
    PreRequestEvent, RecordingHandler, RetryEvent, RotationEvent, TransportEvent,
};
pub use pacing::{HumanPacer, PacingConfig};
pub use profiles::{BrowserProfile, ProfileError, ProfileManager, default_profiles};
pub use rate_limit::{BucketConfig, RateLimitConfig, RateLimiter};
pub use risk::{Activity, RiskConfig, RiskMonitor, RiskSignals, RiskSummary};
pub use session::{RotationPolicy, SessionSnapshot, SessionState, StickyMaterial};
