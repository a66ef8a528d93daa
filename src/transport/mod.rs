//! Session-bound request transport.
//!
//! A [`TransportClient`] owns one logical session: its profile, backend
//! handles, timing history and any challenge material. Every request goes
//! through the same sequence: rotation check, cadence jitter, header
//! composition, backend choice behind the rate limiter, an offloaded send,
//! then response triage (429 waits, challenge fallback, status mapping) with a
//! single retry on the alternate backend for transport failures.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use url::Url;

use crate::backends::{
    BackendError, BackendFactory, BackendKind, BackendRequest, BackendResponse, BackendSet,
    ReqwestBackendFactory,
};
use crate::challenges::detectors::BlockDetector;
use crate::challenges::engine::EngineError;
use crate::challenges::pool::{ChallengeSolver, SolveError};
use crate::modules::circuit::{CircuitBreaker, CircuitError, CircuitPhase};
use crate::modules::events::{
    ChallengeEvent, ErrorEvent, EventDispatcher, EventHandler, PostResponseEvent, PreRequestEvent,
    RetryEvent, RotationEvent, TransportEvent,
};
use crate::modules::headers::{self, HeaderList};
use crate::modules::pacing::uniform_delay;
use crate::modules::profiles::ProfileManager;
use crate::modules::rate_limit::RateLimiter;
use crate::modules::session::{RotationPolicy, SessionSnapshot, SessionState, StickyMaterial};

pub mod registry;

pub use registry::TransportRegistry;

/// Path fragments whose requests run behind the circuit breaker.
pub const DEFAULT_CRITICAL_ENDPOINTS: &[&str] = &[
    "/users/@me",
    "/guilds",
    "/channels",
    "/messages",
    "/gateway",
    "/auth/login",
];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network failure on both backends: {0}")]
    TransientNetwork(String),
    #[error("rate limited after {attempts} retries")]
    RateLimited { attempts: u32 },
    #[error("challenge unresolved: {0}")]
    ChallengeUnresolved(String),
    #[error("challenge automation timed out after {0:?}")]
    AutomationTimeout(Duration),
    #[error("circuit is open for critical endpoints, next trial in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
    #[error("remote returned status {status}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("transport session closed")]
    Closed,
}

impl TransportError {
    /// Failures that say something about the remote's health.
    pub fn trips_circuit(&self) -> bool {
        match self {
            TransportError::TransientNetwork(_)
            | TransportError::RateLimited { .. }
            | TransportError::ChallengeUnresolved(_)
            | TransportError::AutomationTimeout(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub secondary_probability: f64,
    pub max_rate_limit_retries: u32,
    pub default_retry_after: Duration,
    /// Ceiling on any server-requested 429 wait.
    pub max_retry_after: Duration,
    pub variance_window: usize,
    /// Variance (s²) below which the cadence counts as mechanical.
    pub variance_threshold: f64,
    pub variance_delay: (f64, f64),
    pub critical_endpoints: Vec<String>,
    pub rotation: RotationPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            secondary_probability: 0.3,
            max_rate_limit_retries: 5,
            default_retry_after: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(300),
            variance_window: 5,
            variance_threshold: 2.0,
            variance_delay: (0.5, 3.0),
            critical_endpoints: DEFAULT_CRITICAL_ENDPOINTS
                .iter()
                .map(|fragment| fragment.to_string())
                .collect(),
            rotation: RotationPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn is_critical(&self, url: &Url) -> bool {
        let path = url.path();
        self.critical_endpoints
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
    }
}

/// One outbound call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderList,
    pub body: Option<Bytes>,
    pub force_backend: Option<BackendKind>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            force_backend: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn force_backend(mut self, kind: BackendKind) -> Self {
        self.force_backend = Some(kind);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    status: u16,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    backend: BackendKind,
}

impl TransportResponse {
    fn new(response: BackendResponse, backend: BackendKind) -> Self {
        Self {
            status: response.status,
            url: response.url,
            headers: response.headers,
            body: response.body,
            backend,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub session: SessionSnapshot,
    pub circuit_phase: String,
    pub circuit_failures: u32,
    pub closed: bool,
}

/// Configures and builds a [`TransportClient`]. Cloneable so a registry can
/// stamp out one client per session from the same template.
#[derive(Clone)]
pub struct TransportClientBuilder {
    config: TransportConfig,
    factory: Option<Arc<dyn BackendFactory>>,
    profiles: Option<ProfileManager>,
    limiter: Option<RateLimiter>,
    circuit: Option<CircuitBreaker>,
    solver: Option<ChallengeSolver>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl TransportClientBuilder {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            factory: None,
            profiles: None,
            limiter: None,
            circuit: None,
            solver: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileManager) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = Some(circuit);
        self
    }

    pub fn with_challenge_solver(mut self, solver: ChallengeSolver) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(&self, session_id: impl Into<String>) -> TransportResult<TransportClient> {
        let session_id = session_id.into();
        let factory = self
            .factory
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestBackendFactory::default()));
        let profiles = self.profiles.clone().unwrap_or_default();

        let profile = profiles.get_or_create(&session_id);
        let backends = BackendSet::build(factory.as_ref(), &profile)?;
        let session = SessionState::new(session_id.clone(), profile, self.config.rotation.clone());

        let mut events = EventDispatcher::with_logging();
        for handler in &self.handlers {
            events.register_handler(Arc::clone(handler));
        }

        log::debug!(
            "transport for session {session_id} built with profile {}",
            session.profile.name
        );

        Ok(TransportClient {
            session_id,
            config: self.config.clone(),
            factory,
            profiles,
            limiter: self.limiter.clone().unwrap_or_default(),
            circuit: self.circuit.clone().unwrap_or_default(),
            solver: self.solver.clone(),
            detector: BlockDetector::new(),
            events,
            session: Mutex::new(session),
            backends: RwLock::new(Some(backends)),
        })
    }
}

impl Default for TransportClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What `prepare` settled on for one attempt.
struct Prepared {
    headers: HeaderList,
    kind: BackendKind,
    backends: BackendSet,
}

pub struct TransportClient {
    session_id: String,
    config: TransportConfig,
    factory: Arc<dyn BackendFactory>,
    profiles: ProfileManager,
    limiter: RateLimiter,
    circuit: CircuitBreaker,
    solver: Option<ChallengeSolver>,
    detector: BlockDetector,
    events: EventDispatcher,
    session: Mutex<SessionState>,
    backends: RwLock<Option<BackendSet>>,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .finish()
    }
}

impl TransportClient {
    pub fn builder() -> TransportClientBuilder {
        TransportClientBuilder::new()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub async fn get(&self, url: &str) -> TransportResult<TransportResponse> {
        let url = Url::parse(url)?;
        self.send(TransportRequest::new(Method::GET, url)).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: Url,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> TransportResult<TransportResponse> {
        let mut request = TransportRequest::new(method, url);
        request.headers = headers.to_vec();
        request.body = body;
        self.send(request).await
    }

    /// Send `request`, routing critical endpoints through the circuit breaker.
    pub async fn send(&self, request: TransportRequest) -> TransportResult<TransportResponse> {
        validate_headers(&request.headers)?;

        if !self.config.is_critical(&request.url) {
            return self.execute(&request).await;
        }

        match self
            .circuit
            .call_filtered(|| self.execute(&request), TransportError::trips_circuit)
            .await
        {
            Ok(response) => Ok(response),
            Err(CircuitError::Inner(err)) => Err(err),
            Err(CircuitError::Open) => {
                log::warn!("circuit open, rejecting {} {}", request.method, request.url);
                Err(TransportError::CircuitOpen {
                    retry_in: self.circuit.remaining_cooldown(),
                })
            }
            Err(CircuitError::Opened { failures }) => {
                log::error!("circuit opened after {failures} failures on {}", request.url);
                self.emit_error(format!("circuit opened after {failures} failures"));
                Err(TransportError::CircuitOpen {
                    retry_in: self.circuit.remaining_cooldown(),
                })
            }
        }
    }

    async fn execute(&self, request: &TransportRequest) -> TransportResult<TransportResponse> {
        let mut rate_limit_retries = 0u32;
        let mut challenge_solved = false;
        let mut first = true;

        loop {
            let prepared = self.prepare(request, first).await?;
            first = false;

            let (response, kind) = self.send_with_fallback(request, &prepared).await?;
            let status = response.status;

            if status == 429 {
                rate_limit_retries += 1;
                if rate_limit_retries > self.config.max_rate_limit_retries {
                    self.emit_error(format!("rate limited on {}", request.url));
                    return Err(TransportError::RateLimited {
                        attempts: rate_limit_retries - 1,
                    });
                }
                let delay = retry_after(&response)
                    .unwrap_or(self.config.default_retry_after)
                    .min(self.config.max_retry_after);
                log::warn!(
                    "429 from {} (retry {rate_limit_retries}/{}), waiting {:?}",
                    request.url,
                    self.config.max_rate_limit_retries,
                    delay
                );
                self.emit_retry(rate_limit_retries, "rate limited", delay);
                sleep(delay).await;
                continue;
            }

            let body = response.text();
            if let Some(detection) = self.detector.detect(status, &body) {
                if challenge_solved {
                    let detail = format!("still blocked after solving (status {status})");
                    self.emit_challenge(&request.url, false, &detail);
                    return Err(TransportError::ChallengeUnresolved(detail));
                }
                log::warn!(
                    "challenge page on {} (status {}, markers {:?})",
                    request.url,
                    detection.status,
                    detection.markers
                );
                self.resolve_challenge(&request.url, &prepared.headers).await?;
                challenge_solved = true;
                continue;
            }

            if response.is_success() {
                return Ok(TransportResponse::new(response, kind));
            }

            log::debug!("{} {} returned {status}", request.method, request.url);
            return Err(TransportError::Status { status, body });
        }
    }

    async fn prepare(
        &self,
        request: &TransportRequest,
        count_request: bool,
    ) -> TransportResult<Prepared> {
        let extra_delay = {
            let mut session = self.session.lock().await;

            if count_request && session.tick() {
                let previous = session.profile.name.clone();
                let profile = self.profiles.rotate(&self.session_id);
                let backends = BackendSet::build(self.factory.as_ref(), &profile)?;
                self.replace_backends(backends)?;
                session.rotate(profile);
                self.events.dispatch(TransportEvent::Rotation(RotationEvent {
                    session_id: self.session_id.clone(),
                    previous_profile: previous,
                    profile: session.profile.name.clone(),
                    timestamp: Utc::now(),
                }));
            }

            session
                .timing_variance(self.config.variance_window)
                .filter(|variance| *variance < self.config.variance_threshold)
                .map(|variance| {
                    let delay = uniform_delay(self.config.variance_delay);
                    log::debug!(
                        "cadence variance {variance:.3}s² too regular, adding {:?}",
                        delay
                    );
                    delay
                })
        };

        if let Some(delay) = extra_delay {
            sleep(delay).await;
        }

        let session = self.session.lock().await;
        let mut headers = headers::compose(&session.profile, &session.sticky, &request.headers);
        headers::shuffle(&mut headers);
        drop(session);

        let kind = request.force_backend.unwrap_or_else(|| {
            if rand::thread_rng().gen_bool(self.config.secondary_probability.clamp(0.0, 1.0)) {
                BackendKind::Secondary
            } else {
                BackendKind::Primary
            }
        });

        let backends = self.current_backends()?;
        Ok(Prepared { headers, kind, backends })
    }

    async fn send_with_fallback(
        &self,
        request: &TransportRequest,
        prepared: &Prepared,
    ) -> TransportResult<(BackendResponse, BackendKind)> {
        let kind = prepared.kind;
        match self.send_once(request, prepared, kind).await {
            Ok(response) => Ok((response, kind)),
            Err(first) => {
                let alternate = kind.alternate();
                log::warn!("{kind} backend failed ({first}), retrying on {alternate}");
                self.emit_retry(1, &format!("{kind} backend failed: {first}"), Duration::ZERO);
                match self.send_once(request, prepared, alternate).await {
                    Ok(response) => Ok((response, alternate)),
                    Err(second) => {
                        let message = format!("{kind}: {first}; {alternate}: {second}");
                        self.emit_error(message.clone());
                        Err(TransportError::TransientNetwork(message))
                    }
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &TransportRequest,
        prepared: &Prepared,
        kind: BackendKind,
    ) -> Result<BackendResponse, BackendError> {
        self.limiter.acquire(kind).await;

        let backend = prepared.backends.get(kind);
        let backend_request = BackendRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: prepared.headers.clone(),
            body: request.body.clone(),
            timeout: self.config.request_timeout,
        };

        self.session.lock().await.record_request(kind);
        self.events.dispatch(TransportEvent::PreRequest(PreRequestEvent {
            session_id: self.session_id.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
            backend: kind,
            timestamp: Utc::now(),
        }));

        let started = Instant::now();
        let timeout = self.config.request_timeout;
        let mut handle = tokio::spawn(async move { backend.send(backend_request).await });
        let response = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => return Err(BackendError::Transport(join_error.to_string())),
            Err(_) => {
                handle.abort();
                return Err(BackendError::Timeout(timeout));
            }
        };

        self.events.dispatch(TransportEvent::PostResponse(PostResponseEvent {
            session_id: self.session_id.clone(),
            method: request.method.clone(),
            url: response.url.clone(),
            backend: kind,
            status: response.status,
            latency: started.elapsed(),
            timestamp: Utc::now(),
        }));

        Ok(response)
    }

    async fn resolve_challenge(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> TransportResult<()> {
        let Some(solver) = &self.solver else {
            let detail = "no challenge solver configured".to_string();
            self.emit_challenge(url, false, &detail);
            return Err(TransportError::ChallengeUnresolved(detail));
        };

        match solver.solve(&self.session_id, url, headers).await {
            Ok(solution) => {
                let mut session = self.session.lock().await;
                session.sticky = StickyMaterial {
                    cookie_header: solution.cookie_header(),
                    user_agent: Some(solution.user_agent.clone()).filter(|agent| !agent.is_empty()),
                };
                drop(session);
                self.emit_challenge(
                    url,
                    true,
                    &format!("completed by {:?}", solution.completed_by),
                );
                Ok(())
            }
            Err(err) => {
                self.emit_challenge(url, false, &err.to_string());
                Err(match err {
                    SolveError::Engine(EngineError::Timeout(after)) => {
                        TransportError::AutomationTimeout(after)
                    }
                    other => TransportError::ChallengeUnresolved(other.to_string()),
                })
            }
        }
    }

    fn current_backends(&self) -> TransportResult<BackendSet> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)
    }

    fn replace_backends(&self, backends: BackendSet) -> TransportResult<()> {
        let mut slot = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Err(TransportError::Closed);
        }
        *slot = Some(backends);
        Ok(())
    }

    /// Drop the backend handles; later requests fail with [`TransportError::Closed`].
    pub fn close(&self) {
        let previous = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            log::debug!("transport for session {} closed", self.session_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub async fn session_age(&self) -> Duration {
        self.session.lock().await.age()
    }

    pub async fn stats(&self) -> TransportStats {
        let circuit = self.circuit.state();
        TransportStats {
            session: self.session.lock().await.snapshot(),
            circuit_phase: circuit.phase.to_string(),
            circuit_failures: circuit.failure_count,
            closed: self.is_closed(),
        }
    }

    pub fn circuit_phase(&self) -> CircuitPhase {
        self.circuit.state().phase
    }

    fn emit_retry(&self, attempt: u32, reason: &str, scheduled_after: Duration) {
        self.events.dispatch(TransportEvent::Retry(RetryEvent {
            session_id: self.session_id.clone(),
            attempt,
            reason: reason.to_string(),
            scheduled_after,
            timestamp: Utc::now(),
        }));
    }

    fn emit_challenge(&self, url: &Url, success: bool, detail: &str) {
        self.events.dispatch(TransportEvent::Challenge(ChallengeEvent {
            session_id: self.session_id.clone(),
            url: url.clone(),
            success,
            detail: detail.to_string(),
            timestamp: Utc::now(),
        }));
    }

    fn emit_error(&self, error: String) {
        self.events.dispatch(TransportEvent::Error(ErrorEvent {
            session_id: self.session_id.clone(),
            error,
            timestamp: Utc::now(),
        }));
    }
}

fn validate_headers(headers: &[(String, String)]) -> TransportResult<()> {
    for (name, value) in headers {
        http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::InvalidHeader(format!("{name}: {err}")))?;
        http::HeaderValue::from_str(value)
            .map_err(|err| TransportError::InvalidHeader(format!("{name}: {err}")))?;
    }
    Ok(())
}

/// Non-negative finite seconds; values past `Duration::MAX` saturate.
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    (seconds.is_finite() && seconds >= 0.0)
        .then(|| Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

/// Delay requested by a 429: `Retry-After` (seconds or HTTP date), then a
/// JSON `retry_after` field in the body. Callers clamp the result.
pub fn retry_after(response: &BackendResponse) -> Option<Duration> {
    if let Some(raw) = response.header(http::header::RETRY_AFTER.as_str()) {
        let raw = raw.trim();
        if let Some(delay) = raw.parse::<f64>().ok().and_then(seconds_to_duration) {
            return Some(delay);
        }

        if let Ok(date) =
            DateTime::parse_from_rfc2822(raw).or_else(|_| DateTime::parse_from_rfc3339(raw))
            && let Ok(duration) = (date.with_timezone(&Utc) - Utc::now()).to_std()
        {
            return Some(duration);
        }
    }

    let body: serde_json::Value = response.json().ok()?;
    seconds_to_duration(body.get("retry_after")?.as_f64()?)
}
