//! Behavioural risk scoring.
//!
//! Each actor (the account a job runs as) keeps rolling windows of message,
//! channel-access and error events. The score is a capped sum of independent
//! factors computed from those windows and is fed back into worker pacing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const MESSAGE_RATE_WINDOW: Duration = Duration::from_secs(5 * 60);
const CHANNEL_WINDOW: Duration = Duration::from_secs(3600);
const ERROR_WINDOW: Duration = Duration::from_secs(30 * 60);
const PATTERN_WINDOW: Duration = Duration::from_secs(10 * 60);
const PATTERN_MIN_SAMPLES: usize = 10;
const BASE_DELAY: (f64, f64) = (3.0, 12.0);

/// Risk thresholds.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub messages_per_minute: f64,
    pub channels_per_hour: usize,
    pub session_duration_critical: Duration,
    pub critical_score: f64,
    pub max_events: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 5.0,
            channels_per_hour: 10,
            session_duration_critical: Duration::from_secs(4 * 3600),
            critical_score: 0.7,
            max_events: 1000,
        }
    }
}

/// Something an actor did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    MessageFetched,
    ChannelAccessed { channel_id: String },
    Error { reason: String },
}

#[derive(Debug, Default)]
struct RiskWindow {
    messages: VecDeque<Instant>,
    channels: VecDeque<(Instant, String)>,
    errors: VecDeque<Instant>,
    session_start: Option<Instant>,
}

fn push_capped<T>(queue: &mut VecDeque<T>, value: T, cap: usize) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn within(now: Instant, at: Instant, window: Duration) -> bool {
    now.saturating_duration_since(at) < window
}

/// Raw signals the score is computed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskSignals {
    /// Messages per minute over the trailing five minutes.
    pub message_rate: f64,
    pub channels_last_hour: usize,
    pub session_secs: f64,
    pub error_ratio: f64,
    /// 0.0, 0.4 or 0.8 depending on inter-message timing regularity.
    pub pattern_score: f64,
}

impl RiskSignals {
    /// Weighted, clamped score in `[0, 1]`.
    pub fn score(&self, config: &RiskConfig) -> f64 {
        let mut total = 0.0;

        if self.message_rate > config.messages_per_minute {
            total += 0.3 * (self.message_rate / config.messages_per_minute);
        }

        let channel_limit = config.channels_per_hour.max(1) as f64;
        if self.channels_last_hour as f64 > channel_limit {
            total += 0.2 * (self.channels_last_hour as f64 / channel_limit);
        }

        let session_limit = config.session_duration_critical.as_secs_f64().max(1.0);
        if self.session_secs > session_limit {
            total += 0.3 * (self.session_secs / session_limit);
        }

        if self.error_ratio > 0.1 {
            total += 0.2 * (self.error_ratio * 5.0).min(1.0);
        }

        total += 0.2 * self.pattern_score;

        total.clamp(0.0, 1.0)
    }
}

/// Snapshot returned by [`RiskMonitor::summary`].
#[derive(Debug, Clone, Serialize)]
pub struct RiskSummary {
    pub risk_score: f64,
    pub signals: RiskSignals,
    pub should_pause: bool,
}

/// Per-actor risk scoring, shared across jobs.
#[derive(Debug, Clone, Default)]
pub struct RiskMonitor {
    config: RiskConfig,
    windows: Arc<RwLock<HashMap<String, RiskWindow>>>,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Record an event and return the actor's updated score.
    pub fn log_activity(&self, actor_id: &str, activity: Activity) -> f64 {
        let now = Instant::now();
        {
            let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
            let window = windows.entry(actor_id.to_string()).or_default();
            let cap = self.config.max_events.max(1);
            match activity {
                Activity::MessageFetched => push_capped(&mut window.messages, now, cap),
                Activity::ChannelAccessed { channel_id } => {
                    push_capped(&mut window.channels, (now, channel_id), cap)
                }
                Activity::Error { reason } => {
                    log::debug!("actor {actor_id} error recorded: {reason}");
                    push_capped(&mut window.errors, now, cap)
                }
            }
        }

        let risk = self.calculate_risk(actor_id);
        if risk > self.config.critical_score {
            log::warn!("high risk for actor {actor_id}: {risk:.2}");
        }
        risk
    }

    pub fn start_session(&self, actor_id: &str) {
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.entry(actor_id.to_string()).or_default().session_start = Some(Instant::now());
    }

    /// Clears the session clock, returning how long it ran.
    pub fn end_session(&self, actor_id: &str) -> Option<Duration> {
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let started = windows.get_mut(actor_id)?.session_start.take()?;
        let duration = Instant::now().saturating_duration_since(started);
        log::info!("actor {actor_id} session ended after {}s", duration.as_secs());
        Some(duration)
    }

    pub fn signals(&self, actor_id: &str) -> RiskSignals {
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        match windows.get(actor_id) {
            Some(window) => compute_signals(window, Instant::now()),
            None => RiskSignals::default(),
        }
    }

    pub fn calculate_risk(&self, actor_id: &str) -> f64 {
        self.signals(actor_id).score(&self.config)
    }

    pub fn should_pause(&self, actor_id: &str) -> bool {
        self.calculate_risk(actor_id) > self.config.critical_score
    }

    /// Delay range, in seconds, the worker should pace within.
    pub fn recommended_delay(&self, actor_id: &str) -> (f64, f64) {
        scale_delay(self.calculate_risk(actor_id))
    }

    pub fn summary(&self, actor_id: &str) -> RiskSummary {
        let signals = self.signals(actor_id);
        let risk_score = signals.score(&self.config);
        RiskSummary {
            risk_score,
            should_pause: risk_score > self.config.critical_score,
            signals,
        }
    }

    /// Forget everything about an actor.
    pub fn clear(&self, actor_id: &str) {
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.remove(actor_id);
    }
}

fn scale_delay(risk: f64) -> (f64, f64) {
    let (min, max) = BASE_DELAY;
    if risk > 0.5 {
        let multiplier = 1.0 + (risk - 0.5) * 4.0;
        (min * multiplier, max * multiplier)
    } else {
        (min, max)
    }
}

fn compute_signals(window: &RiskWindow, now: Instant) -> RiskSignals {
    RiskSignals {
        message_rate: message_rate(window, now),
        channels_last_hour: window
            .channels
            .iter()
            .filter(|(at, _)| within(now, *at, CHANNEL_WINDOW))
            .map(|(_, channel)| channel.as_str())
            .collect::<HashSet<_>>()
            .len(),
        session_secs: window
            .session_start
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
            .unwrap_or(0.0),
        error_ratio: error_ratio(window, now),
        pattern_score: pattern_score(window, now),
    }
}

fn message_rate(window: &RiskWindow, now: Instant) -> f64 {
    let recent: Vec<Instant> = window
        .messages
        .iter()
        .copied()
        .filter(|at| within(now, *at, MESSAGE_RATE_WINDOW))
        .collect();
    let (Some(first), Some(last)) = (recent.first(), recent.last()) else {
        return 0.0;
    };
    let span_minutes = last.saturating_duration_since(*first).as_secs_f64() / 60.0;
    if span_minutes == 0.0 {
        recent.len() as f64
    } else {
        recent.len() as f64 / span_minutes
    }
}

fn error_ratio(window: &RiskWindow, now: Instant) -> f64 {
    let messages = window
        .messages
        .iter()
        .filter(|at| within(now, **at, ERROR_WINDOW))
        .count();
    if messages == 0 {
        return 0.0;
    }
    let errors = window
        .errors
        .iter()
        .filter(|at| within(now, **at, ERROR_WINDOW))
        .count();
    errors as f64 / messages as f64
}

fn pattern_score(window: &RiskWindow, now: Instant) -> f64 {
    let recent: Vec<Instant> = window
        .messages
        .iter()
        .copied()
        .filter(|at| within(now, *at, PATTERN_WINDOW))
        .collect();
    if recent.len() < PATTERN_MIN_SAMPLES {
        return 0.0;
    }

    let deltas: Vec<f64> = recent
        .windows(2)
        .map(|pair| pair[1].saturating_duration_since(pair[0]).as_secs_f64())
        .collect();
    let variance = variance(&deltas);

    if variance < 2.0 {
        0.8
    } else if variance < 5.0 {
        0.4
    } else {
        0.0
    }
}

/// Population variance; zero for empty input.
pub(crate) fn variance(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_monotonic_in_message_rate() {
        let config = RiskConfig::default();
        let mut previous = 0.0;
        for rate in 0..200 {
            let signals = RiskSignals {
                message_rate: rate as f64 * 0.25,
                channels_last_hour: 3,
                session_secs: 600.0,
                error_ratio: 0.05,
                pattern_score: 0.4,
            };
            let score = signals.score(&config);
            assert!(score >= previous);
            assert!((0.0..=1.0).contains(&score));
            previous = score;
        }
        assert_eq!(previous, 1.0);
    }

    #[test]
    fn score_is_clamped() {
        let signals = RiskSignals {
            message_rate: 500.0,
            channels_last_hour: 100,
            session_secs: 100_000.0,
            error_ratio: 3.0,
            pattern_score: 0.8,
        };
        assert_eq!(signals.score(&RiskConfig::default()), 1.0);
        assert_eq!(RiskSignals::default().score(&RiskConfig::default()), 0.0);
    }

    #[test]
    fn delay_scales_above_half() {
        assert_eq!(scale_delay(0.2), (3.0, 12.0));
        assert_eq!(scale_delay(0.5), (3.0, 12.0));
        let (min, max) = scale_delay(1.0);
        assert!((min - 9.0).abs() < 1e-9);
        assert!((max - 36.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn regular_cadence_is_flagged() {
        let monitor = RiskMonitor::default();
        for _ in 0..12 {
            monitor.log_activity("actor", Activity::MessageFetched);
            tokio::time::advance(Duration::from_secs(20)).await;
        }
        let signals = monitor.signals("actor");
        assert_eq!(signals.pattern_score, 0.8);
        // 12 messages over 220s is about 3.3/min, under the rate threshold
        assert!(signals.message_rate < 5.0);
        assert!((monitor.calculate_risk("actor") - 0.16).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_messages_pauses() {
        let monitor = RiskMonitor::default();
        for _ in 0..30 {
            monitor.log_activity("actor", Activity::MessageFetched);
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        // 30 messages in ~15s: far above 5/min, and perfectly regular
        assert!(monitor.should_pause("actor"));
        let (min, _) = monitor.recommended_delay("actor");
        assert!(min > 3.0);
        assert!(!monitor.should_pause("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_channels_and_errors_count() {
        let monitor = RiskMonitor::default();
        for id in 0..12 {
            monitor.log_activity(
                "actor",
                Activity::ChannelAccessed {
                    channel_id: format!("{id}"),
                },
            );
        }
        monitor.log_activity("actor", Activity::ChannelAccessed { channel_id: "3".into() });
        monitor.log_activity("actor", Activity::MessageFetched);
        monitor.log_activity("actor", Activity::Error { reason: "timeout".into() });

        let signals = monitor.signals("actor");
        assert_eq!(signals.channels_last_hour, 12);
        assert_eq!(signals.error_ratio, 1.0);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let signals = monitor.signals("actor");
        assert_eq!(signals.channels_last_hour, 0);
        assert_eq!(signals.error_ratio, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_duration_tracks_start_and_end() {
        let monitor = RiskMonitor::default();
        monitor.start_session("actor");
        tokio::time::advance(Duration::from_secs(5 * 3600)).await;
        assert!(monitor.calculate_risk("actor") > 0.3);
        assert_eq!(monitor.end_session("actor"), Some(Duration::from_secs(5 * 3600)));
        assert_eq!(monitor.signals("actor").session_secs, 0.0);
        assert_eq!(monitor.end_session("actor"), None);
    }

    #[test]
    fn event_windows_are_capped() {
        let monitor = RiskMonitor::new(RiskConfig {
            max_events: 10,
            ..RiskConfig::default()
        });
        for _ in 0..50 {
            monitor.log_activity("actor", Activity::MessageFetched);
        }
        let windows = monitor.windows.read().unwrap();
        assert_eq!(windows["actor"].messages.len(), 10);
    }
}
