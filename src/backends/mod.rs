//! Fingerprint-emulating HTTP backends.
//!
//! The transport never talks to an HTTP library directly. It asks a
//! [`BackendFactory`] for handles matching the session's profile and sends
//! through the [`HttpBackend`] trait, which keeps the request path testable
//! with scripted backends.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::modules::profiles::BrowserProfile;

pub mod reqwest_backend;

pub use reqwest_backend::ReqwestBackendFactory;

/// Which kind of client carried a request. Each kind has its own rate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Primary,
    Secondary,
    Rendering,
}

impl BackendKind {
    /// The other HTTP backend, used for the single fallback retry.
    pub fn alternate(self) -> Self {
        match self {
            BackendKind::Primary => BackendKind::Secondary,
            BackendKind::Secondary | BackendKind::Rendering => BackendKind::Primary,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Primary => "primary",
            BackendKind::Secondary => "secondary",
            BackendKind::Rendering => "rendering",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: Url,
    /// Emitted in this order where the backend allows it.
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl BackendResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("backend could not be built: {0}")]
    Build(String),
}

/// One configured HTTP client bound to a profile's fingerprint.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Fingerprint id the backend was built for.
    fn fingerprint(&self) -> &str;

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;
}

/// Builds backend handles for a profile.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        kind: BackendKind,
        profile: &BrowserProfile,
    ) -> Result<Arc<dyn HttpBackend>, BackendError>;
}

/// The primary/secondary pair held by one session.
#[derive(Clone)]
pub struct BackendSet {
    pub primary: Arc<dyn HttpBackend>,
    pub secondary: Arc<dyn HttpBackend>,
}

impl BackendSet {
    pub fn build(
        factory: &dyn BackendFactory,
        profile: &BrowserProfile,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            primary: factory.create(BackendKind::Primary, profile)?,
            secondary: factory.create(BackendKind::Secondary, profile)?,
        })
    }

    pub fn get(&self, kind: BackendKind) -> Arc<dyn HttpBackend> {
        match kind {
            BackendKind::Secondary => Arc::clone(&self.secondary),
            BackendKind::Primary | BackendKind::Rendering => Arc::clone(&self.primary),
        }
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet")
            .field("primary", &self.primary.fingerprint())
            .field("secondary", &self.secondary.fingerprint())
            .finish()
    }
}
