//! Closed / open / half-open failure gate for critical platform operations.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Tunables for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            backoff_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    /// A single trial call is in flight.
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub failure_count: u32,
    pub phase: CircuitPhase,
    pub last_failure: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            phase: CircuitPhase::Closed,
            last_failure: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// Rejected without calling the operation.
    #[error("circuit is open")]
    Open,
    /// This call's failure tripped (or re-tripped) the breaker.
    #[error("circuit opened after {failures} failures")]
    Opened { failures: u32 },
    #[error(transparent)]
    Inner(E),
}

/// Failure gate shared by every clone.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: Arc<Mutex<CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CircuitState::default())),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().phase != CircuitPhase::Closed
    }

    /// `min(max_backoff, 2^failures * base)`
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    /// Run `operation` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Run `operation` through the breaker. Errors for which `counts` returns
    /// false pass through without touching the failure counter.
    pub async fn call_filtered<T, E, F, Fut, P>(
        &self,
        operation: F,
        counts: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let trial = self.admit()?;
        // Hands the trial slot back if this future is dropped mid-call, or if
        // the call ends in an error that says nothing about the dependency.
        let _guard = TrialGuard {
            breaker: self,
            trial,
        };

        match operation().await {
            Ok(value) => {
                self.record_success(trial);
                Ok(value)
            }
            Err(err) if counts(&err) => Err(self.record_failure(trial, err).await),
            Err(err) => Err(CircuitError::Inner(err)),
        }
    }

    /// Time left before the next trial call is admitted. Zero when closed.
    pub fn remaining_cooldown(&self) -> Duration {
        let state = self.lock();
        match (state.phase, state.last_failure) {
            (CircuitPhase::Closed, _) | (_, None) => Duration::ZERO,
            (_, Some(at)) => (at + self.config.cooldown).saturating_duration_since(Instant::now()),
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        *self.lock() = CircuitState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let mut state = self.lock();
        match state.phase {
            CircuitPhase::Closed => Ok(false),
            CircuitPhase::HalfOpen => Err(CircuitError::Open),
            CircuitPhase::Open => {
                let cooled = state.last_failure.is_none_or(|at| {
                    Instant::now().saturating_duration_since(at) >= self.config.cooldown
                });
                if cooled {
                    log::info!("circuit cooldown elapsed, allowing one trial call");
                    state.phase = CircuitPhase::HalfOpen;
                    Ok(true)
                } else {
                    Err(CircuitError::Open)
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut state = self.lock();
        if trial || state.failure_count > 0 {
            log::info!("circuit closed after successful call");
        }
        *state = CircuitState::default();
    }

    async fn record_failure<E>(&self, trial: bool, err: E) -> CircuitError<E> {
        let (failures, outcome) = {
            let mut state = self.lock();
            state.failure_count += 1;
            state.last_failure = Some(Instant::now());
            let failures = state.failure_count;

            if trial {
                state.phase = CircuitPhase::Open;
                (failures, FailureOutcome::Reopened)
            } else if failures >= self.config.failure_threshold {
                state.phase = CircuitPhase::Open;
                (failures, FailureOutcome::Opened)
            } else {
                (failures, FailureOutcome::Counted)
            }
        };

        match outcome {
            FailureOutcome::Opened => {
                log::error!("circuit opened after {failures} failures");
                CircuitError::Opened { failures }
            }
            FailureOutcome::Reopened => {
                let wait = self.backoff_for(failures);
                log::error!(
                    "circuit trial failed, re-opening after {}s backoff",
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
                // The cooldown is measured from the end of the backoff.
                self.lock().last_failure = Some(Instant::now());
                CircuitError::Opened { failures }
            }
            FailureOutcome::Counted => {
                let wait = self.backoff_for(failures);
                log::warn!(
                    "protected call failed ({failures}/{}), backing off {}s",
                    self.config.failure_threshold,
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
                CircuitError::Inner(err)
            }
        }
    }
}

/// Returns a half-open breaker to open when its trial call never reports.
/// `last_failure` is left alone, so the next caller after the cooldown gets a
/// fresh trial.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.trial {
            return;
        }
        let mut state = self.breaker.lock();
        if state.phase == CircuitPhase::HalfOpen {
            log::warn!("circuit trial ended without a verdict, back to open");
            state.phase = CircuitPhase::Open;
        }
    }
}

enum FailureOutcome {
    Counted,
    Opened,
    Reopened,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
