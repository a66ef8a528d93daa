//! Rendering-engine abstraction and the challenge completion wait.
//!
//! A [`RenderingEngine`] launches real browser sessions. [`solve_in_session`]
//! drives one session through a challenge page and decides when it is done,
//! using three signals: the application's loaded markers with the document
//! ready, the challenge container disappearing after it was seen, or the page
//! URL moving away from where it settled after navigation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::challenges::detectors::{CHALLENGE_SELECTORS, LOADED_SELECTORS};

pub mod chrome;

pub use chrome::{ChromeConfig, ChromeEngine};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch rendering engine: {0}")]
    Launch(String),
    #[error("devtools protocol error: {0}")]
    Protocol(String),
    #[error("challenge not completed within {0:?}")]
    Timeout(Duration),
    #[error("engine session closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// DOM state sampled while waiting for a challenge to complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProbe {
    pub url: String,
    pub ready_state: String,
    pub loaded_marker: bool,
    pub challenge_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
}

/// One live browser page.
#[async_trait]
pub trait RenderSession: Send {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()>;

    async fn set_extra_headers(&mut self, headers: &[(String, String)]) -> EngineResult<()>;

    async fn navigate(&mut self, url: &Url) -> EngineResult<()>;

    async fn probe(&mut self) -> EngineResult<PageProbe>;

    async fn cookies(&mut self, url: &Url) -> EngineResult<Vec<EngineCookie>>;

    async fn user_agent(&mut self) -> EngineResult<String>;

    /// `(localStorage, sessionStorage)` of the current page.
    async fn storage(&mut self) -> EngineResult<(HashMap<String, String>, HashMap<String, String>)>;

    async fn close(&mut self) -> EngineResult<()>;
}

/// Launches browser sessions.
#[async_trait]
pub trait RenderingEngine: Send + Sync {
    async fn launch(&self) -> EngineResult<Box<dyn RenderSession>>;
}

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompletionSignal {
    Loaded,
    ChallengeCleared,
    UrlChanged,
}

/// Material harvested from a solved challenge.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeSolution {
    pub cookies: Vec<EngineCookie>,
    pub user_agent: String,
    pub local_storage: HashMap<String, String>,
    pub session_storage: HashMap<String, String>,
    pub completed_by: CompletionSignal,
}

impl ChallengeSolution {
    /// `name=value; name=value` form for reattaching to HTTP requests.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SolveConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Expression evaluated in the page for every probe.
pub fn probe_expression() -> String {
    let quote = |selectors: &[&str]| {
        selectors
            .iter()
            .map(|selector| format!("'{selector}'"))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        "(() => {{ const any = (list) => list.some((s) => document.querySelector(s) !== null); \
         return {{ url: location.href, readyState: document.readyState, \
         loadedMarker: any([{}]), challengePresent: any([{}]) }}; }})()",
        quote(LOADED_SELECTORS),
        quote(CHALLENGE_SELECTORS)
    )
}

/// Tracks probes across the wait and reports the first completion signal.
#[derive(Debug, Default)]
struct CompletionWatch {
    settled_url: Option<String>,
    challenge_seen: bool,
}

impl CompletionWatch {
    fn observe(&mut self, probe: &PageProbe) -> Option<CompletionSignal> {
        if probe.loaded_marker && probe.ready_state == "complete" {
            return Some(CompletionSignal::Loaded);
        }

        if probe.challenge_present {
            self.challenge_seen = true;
        } else if self.challenge_seen {
            return Some(CompletionSignal::ChallengeCleared);
        }

        match &self.settled_url {
            None => {
                self.settled_url = Some(probe.url.clone());
                None
            }
            Some(settled) if *settled != probe.url => Some(CompletionSignal::UrlChanged),
            Some(_) => None,
        }
    }
}

/// Drive `session` through the challenge at `url` and harvest its material.
pub async fn solve_in_session(
    session: &mut dyn RenderSession,
    url: &Url,
    headers: &[(String, String)],
    config: &SolveConfig,
) -> EngineResult<ChallengeSolution> {
    if let Some((_, agent)) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
    {
        session.set_user_agent(agent).await?;
    }

    let extra: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("user-agent") && !name.eq_ignore_ascii_case("cookie")
        })
        .cloned()
        .collect();
    if !extra.is_empty() {
        session.set_extra_headers(&extra).await?;
    }

    log::info!("navigating to {url} to solve challenge");
    let deadline = Instant::now() + config.timeout;
    tokio::time::timeout_at(deadline, complete_and_harvest(session, url, config.poll_interval))
        .await
        .map_err(|_| EngineError::Timeout(config.timeout))?
}

/// Navigate, wait for a completion signal, then collect the session material.
/// Unbounded on its own; the caller puts the deadline around all of it.
async fn complete_and_harvest(
    session: &mut dyn RenderSession,
    url: &Url,
    poll_interval: Duration,
) -> EngineResult<ChallengeSolution> {
    session.navigate(url).await?;

    let mut watch = CompletionWatch::default();
    let completed_by = loop {
        let probe = session.probe().await?;
        if let Some(signal) = watch.observe(&probe) {
            break signal;
        }
        tokio::time::sleep(poll_interval).await;
    };

    log::debug!("challenge at {url} completed ({completed_by:?})");

    let cookies = session.cookies(url).await?;
    let user_agent = session.user_agent().await?;
    let (local_storage, session_storage) = session.storage().await?;

    Ok(ChallengeSolution {
        cookies,
        user_agent,
        local_storage,
        session_storage,
        completed_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(url: &str, ready: &str, loaded: bool, challenge: bool) -> PageProbe {
        PageProbe {
            url: url.into(),
            ready_state: ready.into(),
            loaded_marker: loaded,
            challenge_present: challenge,
        }
    }

    #[test]
    fn loaded_marker_needs_complete_document() {
        let mut watch = CompletionWatch::default();
        assert_eq!(watch.observe(&probe("https://a/", "interactive", true, false)), None);
        assert_eq!(
            watch.observe(&probe("https://a/", "complete", true, false)),
            Some(CompletionSignal::Loaded)
        );
    }

    #[test]
    fn challenge_must_be_seen_before_it_can_clear() {
        let mut watch = CompletionWatch::default();
        assert_eq!(watch.observe(&probe("https://a/", "complete", false, false)), None);
        assert_eq!(watch.observe(&probe("https://a/", "complete", false, true)), None);
        assert_eq!(
            watch.observe(&probe("https://a/", "complete", false, false)),
            Some(CompletionSignal::ChallengeCleared)
        );
    }

    #[test]
    fn url_change_after_settling() {
        let mut watch = CompletionWatch::default();
        assert_eq!(watch.observe(&probe("https://a/cdn-cgi", "loading", false, true)), None);
        assert_eq!(
            watch.observe(&probe("https://a/channels", "loading", false, true)),
            Some(CompletionSignal::UrlChanged)
        );
    }

    #[test]
    fn probe_expression_lists_selectors() {
        let expression = probe_expression();
        assert!(expression.contains("'#app-mount'"));
        assert!(expression.contains("'#challenge-form'"));
        assert!(expression.contains("readyState"));
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let solution = ChallengeSolution {
            cookies: vec![
                EngineCookie { name: "cf_clearance".into(), value: "abc".into(), domain: ".x".into() },
                EngineCookie { name: "__cfruid".into(), value: "def".into(), domain: ".x".into() },
            ],
            user_agent: "UA".into(),
            local_storage: HashMap::new(),
            session_storage: HashMap::new(),
            completed_by: CompletionSignal::Loaded,
        };
        assert_eq!(solution.cookie_header().as_deref(), Some("cf_clearance=abc; __cfruid=def"));
    }
}
