//! Per-session gate on challenge solve attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub attempt_limit: usize,
    pub window: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            attempt_limit: 3,
            window: Duration::from_secs(30 * 60),
            max_consecutive_failures: 5,
        }
    }
}

/// Attempt history for one session.
#[derive(Debug, Default, Clone)]
pub struct ChallengeRecord {
    pub attempts: VecDeque<Instant>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<String, ChallengeRecord>,
    total: u64,
    successes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackerStats {
    pub total_challenges: u64,
    pub successful_solves: u64,
    pub success_rate: f64,
    pub active_sessions: usize,
}

/// Shared tracker; clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct ChallengeTracker {
    config: TrackerConfig,
    state: Arc<Mutex<TrackerState>>,
}

impl ChallengeTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// False once `attempt_limit` attempts fall inside the trailing window.
    pub fn should_auto_solve(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(record) = state.records.get_mut(session_id) else {
            return true;
        };
        while record
            .attempts
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.config.window)
        {
            record.attempts.pop_front();
        }
        record.attempts.len() < self.config.attempt_limit
    }

    pub fn too_many_failures(&self, session_id: &str) -> bool {
        self.lock()
            .records
            .get(session_id)
            .is_some_and(|record| {
                record.consecutive_failures >= self.config.max_consecutive_failures
            })
    }

    /// Both gates in one call.
    pub fn may_attempt(&self, session_id: &str) -> bool {
        if self.too_many_failures(session_id) {
            log::error!("too many consecutive challenge failures for session {session_id}");
            return false;
        }
        if !self.should_auto_solve(session_id) {
            log::warn!("challenge attempt limit reached for session {session_id}");
            return false;
        }
        true
    }

    pub fn record(&self, session_id: &str, success: bool) {
        let mut state = self.lock();
        state.total += 1;
        if success {
            state.successes += 1;
        }
        let record = state.records.entry(session_id.to_string()).or_default();
        record.attempts.push_back(Instant::now());
        if success {
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures += 1;
        }
    }

    pub fn record_for(&self, session_id: &str) -> Option<ChallengeRecord> {
        self.lock().records.get(session_id).cloned()
    }

    pub fn forget(&self, session_id: &str) {
        self.lock().records.remove(session_id);
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.lock();
        TrackerStats {
            total_challenges: state.total,
            successful_solves: state.successes,
            success_rate: state.successes as f64 / state.total.max(1) as f64,
            active_sessions: state.records.len(),
        }
    }
}
