//! Transport event hooks.
//!
//! The transport reports what it does through a dispatcher so that logging
//! and custom reactions stay out of the request path.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

use crate::backends::BackendKind;

#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub session_id: String,
    pub method: Method,
    pub url: Url,
    pub backend: BackendKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub session_id: String,
    pub method: Method,
    pub url: Url,
    pub backend: BackendKind,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub session_id: String,
    pub url: Url,
    pub success: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub session_id: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub session_id: String,
    pub previous_profile: String,
    pub profile: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub session_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Challenge(ChallengeEvent),
    Retry(RetryEvent),
    Rotation(RotationEvent),
    Error(ErrorEvent),
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &TransportEvent);
}

/// Broadcasts events to every registered handler.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with a [`LoggingHandler`] already installed.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: TransportEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Turns events into `log` records.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &TransportEvent) {
        match event {
            TransportEvent::PreRequest(pre) => {
                log::debug!(
                    "[{}] -> {} {} via {}",
                    pre.session_id,
                    pre.method,
                    pre.url,
                    pre.backend
                );
            }
            TransportEvent::PostResponse(post) => {
                log::debug!(
                    "[{}] <- {} {} -> {} via {} ({:.2}s)",
                    post.session_id,
                    post.method,
                    post.url,
                    post.status,
                    post.backend,
                    post.latency.as_secs_f64()
                );
            }
            TransportEvent::Challenge(challenge) => {
                log::info!(
                    "[{}] challenge at {} success={} {}",
                    challenge.session_id,
                    challenge.url,
                    challenge.success,
                    challenge.detail
                );
            }
            TransportEvent::Retry(retry) => {
                log::info!(
                    "[{}] retry {} ({}) after {:.2}s",
                    retry.session_id,
                    retry.attempt,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            TransportEvent::Rotation(rotation) => {
                log::info!(
                    "[{}] rotated profile {} -> {}",
                    rotation.session_id,
                    rotation.previous_profile,
                    rotation.profile
                );
            }
            TransportEvent::Error(error) => {
                log::warn!("[{}] {}", error.session_id, error.error);
            }
        }
    }
}

/// Keeps every event in memory. Handy for assertions.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &TransportEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_to_every_handler() {
        let mut dispatcher = EventDispatcher::with_logging();
        let recorder = Arc::new(RecordingHandler::default());
        dispatcher.register_handler(recorder.clone());
        dispatcher.dispatch(TransportEvent::Error(ErrorEvent {
            session_id: "s1".into(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        dispatcher.dispatch(TransportEvent::Rotation(RotationEvent {
            session_id: "s1".into(),
            previous_profile: "chrome_win".into(),
            profile: "safari_mac".into(),
            timestamp: Utc::now(),
        }));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransportEvent::Rotation(_)));
    }
}
