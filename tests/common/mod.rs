#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use url::Url;

use quietfetch::backends::{
    BackendError, BackendFactory, BackendKind, BackendRequest, BackendResponse, HttpBackend,
};
use quietfetch::challenges::engine::{
    EngineCookie, EngineError, EngineResult, PageProbe, RenderSession, RenderingEngine,
};
use quietfetch::modules::profiles::BrowserProfile;
use quietfetch::modules::rate_limit::{BucketConfig, RateLimitConfig, RateLimiter};

pub const BLOCK_PAGE: &str =
    "<html><head><title>Just a moment...</title></head><body><div id=\"challenge-platform\">Checking your browser</div></body></html>";

pub enum Reply {
    Status {
        status: u16,
        body: String,
        headers: Vec<(String, String)>,
    },
    Fail(BackendError),
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Reply::Status {
            status: 200,
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Reply::Status {
            status,
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            Reply::Status {
                status,
                body,
                mut headers,
            } => {
                headers.push((name.to_string(), value.to_string()));
                Reply::Status { status, body, headers }
            }
            fail => fail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub kind: BackendKind,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl Sent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

type Responder = Box<dyn Fn(&BackendRequest) -> Reply + Send + Sync>;

/// Queued replies first, then the responder, then a plain 200.
#[derive(Default)]
pub struct Script {
    replies: Mutex<VecDeque<Reply>>,
    responder: Mutex<Option<Responder>>,
    sent: Mutex<Vec<Sent>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&BackendRequest) -> Reply + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn answer(&self, kind: BackendKind, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.sent.lock().unwrap().push(Sent {
            kind,
            url: request.url.clone(),
            headers: request.headers.clone(),
        });

        let queued = self.replies.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => match self.responder.lock().unwrap().as_ref() {
                Some(responder) => responder(request),
                None => Reply::ok("{}"),
            },
        };

        match reply {
            Reply::Fail(err) => Err(err),
            Reply::Status { status, body, headers } => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(
                        HeaderName::from_bytes(name.as_bytes()).unwrap(),
                        HeaderValue::from_str(&value).unwrap(),
                    );
                }
                Ok(BackendResponse {
                    status,
                    headers: map,
                    body: Bytes::from(body),
                    url: request.url.clone(),
                })
            }
        }
    }
}

pub struct ScriptedBackend {
    kind: BackendKind,
    fingerprint: String,
    script: Arc<Script>,
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        self.script.answer(self.kind, &request)
    }
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
    pub created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            script,
            created: AtomicUsize::new(0),
        })
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, kind: BackendKind, profile: &BrowserProfile) -> Result<Arc<dyn HttpBackend>, BackendError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let fingerprint = match kind {
            BackendKind::Secondary => profile.secondary_fingerprint.clone(),
            _ => profile.primary_fingerprint.clone(),
        };
        Ok(Arc::new(ScriptedBackend {
            kind,
            fingerprint,
            script: Arc::clone(&self.script),
        }))
    }
}

/// Limiter that never throttles.
pub fn open_limiter() -> RateLimiter {
    let wide = BucketConfig::new(10_000.0, 10_000);
    RateLimiter::new(RateLimitConfig {
        primary: wide,
        secondary: wide,
        rendering: wide,
    })
}

/// Platform message payload with id `id` at `2024-01-01T00:00:00Z + id` seconds.
pub fn message_json(id: u64) -> Value {
    let timestamp = chrono::DateTime::<chrono::Utc>::from_timestamp(1_704_067_200 + id as i64, 0).unwrap();
    json!({
        "id": id.to_string(),
        "author": {"id": "7", "username": "ada"},
        "content": format!("message {id}"),
        "timestamp": timestamp.to_rfc3339(),
        "edited_timestamp": null,
        "attachments": [],
        "embeds": [],
        "reactions": []
    })
}

/// Serves `/channels/{id}/messages?after=&limit=` from a shared list, newest
/// first like the real API.
pub fn message_api(messages: Arc<Mutex<Vec<u64>>>) -> impl Fn(&BackendRequest) -> Reply + Send + Sync + 'static {
    move |request: &BackendRequest| {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let after: u64 = query.get("after").and_then(|raw| raw.parse().ok()).unwrap_or(0);
        let limit: usize = query.get("limit").and_then(|raw| raw.parse().ok()).unwrap_or(50);
        let mut ids: Vec<u64> = messages
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|id| *id > after)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        ids.reverse();
        let page: Vec<Value> = ids.into_iter().map(message_json).collect();
        Reply::ok(Value::Array(page).to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBehavior {
    Solve,
    Hang,
    /// Navigation works but the page never answers a probe.
    HangProbe,
    FailLaunch,
}

#[derive(Clone)]
pub struct MockEngine {
    pub behavior: EngineBehavior,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub launched: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new(behavior: EngineBehavior) -> Self {
        Self {
            behavior,
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
            launched: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RenderingEngine for MockEngine {
    async fn launch(&self) -> EngineResult<Box<dyn RenderSession>> {
        if self.behavior == EngineBehavior::FailLaunch {
            return Err(EngineError::Launch("no browser available".into()));
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            behavior: self.behavior,
            live: Arc::clone(&self.live),
            closed: Arc::clone(&self.closed),
            user_agent: None,
        }))
    }
}

pub struct MockSession {
    behavior: EngineBehavior,
    live: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    user_agent: Option<String>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderSession for MockSession {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()> {
        self.user_agent = Some(user_agent.to_string());
        Ok(())
    }

    async fn set_extra_headers(&mut self, _headers: &[(String, String)]) -> EngineResult<()> {
        Ok(())
    }

    async fn navigate(&mut self, _url: &Url) -> EngineResult<()> {
        if self.behavior == EngineBehavior::Hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn probe(&mut self) -> EngineResult<PageProbe> {
        if self.behavior == EngineBehavior::HangProbe {
            std::future::pending::<()>().await;
        }
        Ok(PageProbe {
            url: "https://platform.test/channels/@me".into(),
            ready_state: "complete".into(),
            loaded_marker: true,
            challenge_present: false,
        })
    }

    async fn cookies(&mut self, _url: &Url) -> EngineResult<Vec<EngineCookie>> {
        Ok(vec![EngineCookie {
            name: "cf_clearance".into(),
            value: "solved".into(),
            domain: "platform.test".into(),
        }])
    }

    async fn user_agent(&mut self) -> EngineResult<String> {
        Ok(self.user_agent.clone().unwrap_or_else(|| "MockBrowser/1.0".into()))
    }

    async fn storage(&mut self) -> EngineResult<(HashMap<String, String>, HashMap<String, String>)> {
        Ok((HashMap::new(), HashMap::new()))
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
