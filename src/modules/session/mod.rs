//! Mutable per-session transport state.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::backends::BackendKind;
use crate::modules::profiles::BrowserProfile;
use crate::modules::risk::variance;

const MAX_DELTAS: usize = 20;

/// Bounds for the randomised rotation triggers.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub request_threshold: (u32, u32),
    pub age_limit: (Duration, Duration),
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            request_threshold: (50, 150),
            age_limit: (Duration::from_secs(2 * 3600), Duration::from_secs(4 * 3600)),
        }
    }
}

impl RotationPolicy {
    fn draw(&self) -> (u32, Duration) {
        let mut rng = rand::thread_rng();
        let (low, high) = self.request_threshold;
        let threshold = rng.gen_range(low.max(1)..=high.max(low.max(1)));
        let (min_age, max_age) = self.age_limit;
        let age = if max_age > min_age {
            rng.gen_range(min_age..=max_age)
        } else {
            min_age
        };
        (threshold, age)
    }
}

/// Cookies and user agent captured from a solved challenge, reattached to
/// every later request of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StickyMaterial {
    pub cookie_header: Option<String>,
    pub user_agent: Option<String>,
}

impl StickyMaterial {
    pub fn is_empty(&self) -> bool {
        self.cookie_header.is_none() && self.user_agent.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub profile: BrowserProfile,
    pub request_count: u32,
    pub rotation_threshold: u32,
    pub started_at: Instant,
    pub age_limit: Duration,
    pub deltas: VecDeque<Duration>,
    pub backend_counts: HashMap<BackendKind, u64>,
    pub last_request: Option<Instant>,
    pub sticky: StickyMaterial,
    pub rotations: u32,
    policy: RotationPolicy,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        profile: BrowserProfile,
        policy: RotationPolicy,
    ) -> Self {
        let (rotation_threshold, age_limit) = policy.draw();
        Self {
            session_id: session_id.into(),
            profile,
            request_count: 0,
            rotation_threshold,
            started_at: Instant::now(),
            age_limit,
            deltas: VecDeque::with_capacity(MAX_DELTAS),
            backend_counts: HashMap::new(),
            last_request: None,
            sticky: StickyMaterial::default(),
            rotations: 0,
            policy,
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    /// Counts the request and reports whether the session is due a rotation.
    pub fn tick(&mut self) -> bool {
        self.request_count += 1;
        self.request_count >= self.rotation_threshold || self.age() > self.age_limit
    }

    /// Fresh identity: new profile, new thresholds, counters and sticky
    /// material cleared.
    pub fn rotate(&mut self, profile: BrowserProfile) {
        let (rotation_threshold, age_limit) = self.policy.draw();
        log::info!(
            "rotating session {} after {} requests: {} -> {}",
            self.session_id,
            self.request_count,
            self.profile.name,
            profile.name
        );
        self.profile = profile;
        self.request_count = 0;
        self.rotation_threshold = rotation_threshold;
        self.started_at = Instant::now();
        self.age_limit = age_limit;
        self.deltas.clear();
        self.backend_counts.clear();
        self.last_request = None;
        self.sticky = StickyMaterial::default();
        self.rotations += 1;
    }

    /// Population variance (s²) of the last `window` inter-request deltas, or
    /// `None` while fewer than `window` deltas are known.
    pub fn timing_variance(&self, window: usize) -> Option<f64> {
        if window == 0 || self.deltas.len() < window {
            return None;
        }
        let samples: Vec<f64> = self
            .deltas
            .iter()
            .rev()
            .take(window)
            .map(Duration::as_secs_f64)
            .collect();
        Some(variance(&samples))
    }

    /// Note that a request was sent now through `kind`.
    pub fn record_request(&mut self, kind: BackendKind) {
        let now = Instant::now();
        if let Some(previous) = self.last_request {
            if self.deltas.len() == MAX_DELTAS {
                self.deltas.pop_front();
            }
            self.deltas.push_back(now.saturating_duration_since(previous));
        }
        self.last_request = Some(now);
        *self.backend_counts.entry(kind).or_default() += 1;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            profile: self.profile.name.clone(),
            request_count: self.request_count,
            rotation_threshold: self.rotation_threshold,
            age_secs: self.age().as_secs(),
            rotations: self.rotations,
            backend_counts: self
                .backend_counts
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            has_challenge_material: !self.sticky.is_empty(),
        }
    }
}

/// Serializable view of a session for stats output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub profile: String,
    pub request_count: u32,
    pub rotation_threshold: u32,
    pub age_secs: u64,
    pub rotations: u32,
    pub backend_counts: HashMap<String, u64>,
    pub has_challenge_material: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::profiles::default_profiles;

    fn session(threshold: u32) -> SessionState {
        SessionState::new(
            "s1",
            default_profiles().remove(0),
            RotationPolicy {
                request_threshold: (threshold, threshold),
                ..RotationPolicy::default()
            },
        )
    }

    #[test]
    fn thresholds_fall_in_policy_bounds() {
        for _ in 0..100 {
            let state = SessionState::new("s", default_profiles().remove(0), RotationPolicy::default());
            assert!((50..=150).contains(&state.rotation_threshold));
            assert!(state.age_limit >= Duration::from_secs(7200));
            assert!(state.age_limit <= Duration::from_secs(14400));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_due_at_request_threshold() {
        let mut state = session(3);
        assert!(!state.tick());
        assert!(!state.tick());
        assert!(state.tick());
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_due_after_age_limit() {
        let mut state = session(1000);
        tokio::time::advance(state.age_limit + Duration::from_secs(1)).await;
        assert!(state.tick());
    }

    #[tokio::test(start_paused = true)]
    async fn rotate_resets_counters() {
        let mut state = session(10);
        state.tick();
        state.record_request(BackendKind::Primary);
        tokio::time::advance(Duration::from_secs(1)).await;
        state.record_request(BackendKind::Secondary);
        state.sticky.cookie_header = Some("cf_clearance=abc".into());

        let next = default_profiles().remove(2);
        state.rotate(next.clone());

        assert_eq!(state.profile, next);
        assert_eq!(state.request_count, 0);
        assert!(state.deltas.is_empty());
        assert!(state.backend_counts.is_empty());
        assert!(state.sticky.is_empty());
        assert_eq!(state.rotations, 1);
        assert_eq!(state.rotation_threshold, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn variance_uses_recent_deltas() {
        let mut state = session(100);
        for _ in 0..6 {
            state.record_request(BackendKind::Primary);
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(state.deltas.len(), 5);
        assert_eq!(state.timing_variance(5), Some(0.0));
        assert_eq!(state.timing_variance(6), None);

        for _ in 0..30 {
            state.record_request(BackendKind::Primary);
        }
        assert_eq!(state.deltas.len(), MAX_DELTAS);
        assert_eq!(state.backend_counts[&BackendKind::Primary], 36);
    }
}
